//! Declarative pattern matching over relation nodes.
//!
//! A pattern is a star graph: one center class plus edges, each naming a
//! relation class incident on the center and a predicate over the
//! (center, leaf) node pair. Matching enumerates every center node whose
//! edges all have at least one satisfying leaf and emits the Cartesian
//! product of the per-edge leaf sets.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::error::{DbError, Result};
use crate::pager::PageAllocator;
use crate::storage::{open_store, NodeRecord};
use crate::types::{Class, Object, ObjectId};

pub type EdgePredicate = Box<dyn Fn(&NodeRecord, &NodeRecord) -> bool>;

pub struct PatternEdge {
    relation: Arc<Class>,
    predicate: EdgePredicate,
}

impl PatternEdge {
    pub fn relation(&self) -> &Arc<Class> {
        &self.relation
    }

    /// The endpoint class a leaf node comes from: the side of the relation
    /// that is not the center (the center itself for self-relations).
    fn leaf_class(&self, center: &str) -> Arc<Class> {
        let Class::Relation {
            ingress, egress, ..
        } = self.relation.as_ref()
        else {
            unreachable!("pattern edges only hold relation classes");
        };
        if ingress.serialize() == center {
            if egress.serialize() == center {
                ingress.clone()
            } else {
                egress.clone()
            }
        } else {
            ingress.clone()
        }
    }
}

pub struct Pattern {
    center: Arc<Class>,
    edges: Vec<PatternEdge>,
}

impl Pattern {
    pub fn new(center: Arc<Class>) -> Self {
        Self {
            center,
            edges: Vec::new(),
        }
    }

    pub fn center(&self) -> &Arc<Class> {
        &self.center
    }

    pub fn edges(&self) -> &[PatternEdge] {
        &self.edges
    }

    /// Appends an edge. The relation must touch the center class on at
    /// least one side.
    pub fn add_relation(
        &mut self,
        relation: Arc<Class>,
        predicate: impl Fn(&NodeRecord, &NodeRecord) -> bool + 'static,
    ) -> Result<()> {
        let Class::Relation {
            ingress, egress, ..
        } = relation.as_ref()
        else {
            return Err(DbError::BadArgument(format!(
                "class {} is not a relation",
                relation.name()
            )));
        };
        let center = self.center.serialize();
        if ingress.serialize() != center && egress.serialize() != center {
            return Err(DbError::BadArgument(format!(
                "relation {} is not incident on class {}",
                relation.name(),
                self.center.name()
            )));
        }
        self.edges.push(PatternEdge {
            relation,
            predicate: Box::new(predicate),
        });
        Ok(())
    }
}

/// Rows come out ascending by center id, then lexicographic by the leaf
/// id tuple. Each row is a struct of the center node followed by one leaf
/// node per edge. Relation nodes with a dead endpoint are skipped;
/// self-loops are matched as (center, center).
pub(crate) fn pattern_match(
    alloc: &mut PageAllocator,
    pattern: &Pattern,
    sink: &mut dyn FnMut(Object) -> Result<()>,
) -> Result<()> {
    let center_key = pattern.center().serialize();
    let mut centers = collect_all(alloc, pattern.center())?;
    centers.sort_by_key(|record| record.id);

    // one relation scan per edge, one node map per distinct leaf class
    let mut relations = Vec::with_capacity(pattern.edges().len());
    let mut leaves: HashMap<String, HashMap<ObjectId, NodeRecord>> = HashMap::new();
    for edge in pattern.edges() {
        relations.push(collect_all(alloc, edge.relation())?);
        let leaf_class = edge.leaf_class(&center_key);
        let key = leaf_class.serialize();
        if !leaves.contains_key(&key) {
            let nodes = if key == center_key {
                centers.clone()
            } else {
                collect_all(alloc, &leaf_class)?
            };
            leaves.insert(key, nodes.into_iter().map(|r| (r.id, r)).collect());
        }
    }

    let mut row_classes = Vec::with_capacity(1 + pattern.edges().len());
    row_classes.push(pattern.center().clone());
    for edge in pattern.edges() {
        row_classes.push(edge.leaf_class(&center_key));
    }
    let row_class = Class::structure("match", row_classes)?;

    let mut rows = 0u64;
    'centers: for center in &centers {
        let mut leaf_sets: Vec<Vec<&NodeRecord>> = Vec::with_capacity(pattern.edges().len());
        for (edge, relation_nodes) in pattern.edges().iter().zip(&relations) {
            let Class::Relation {
                ingress, egress, ..
            } = edge.relation().as_ref()
            else {
                unreachable!("pattern edges only hold relation classes");
            };
            let ingress_is_center = ingress.serialize() == center_key;
            let egress_is_center = egress.serialize() == center_key;
            let leaf_map = &leaves[&edge.leaf_class(&center_key).serialize()];

            let mut matched = BTreeSet::new();
            for relation in relation_nodes {
                let from = relation.object.ingress()?;
                let to = relation.object.egress()?;
                if ingress_is_center && from == center.id {
                    if let Some(leaf) = leaf_map.get(&to) {
                        if (edge.predicate)(center, leaf) {
                            matched.insert(to);
                        }
                    }
                }
                if egress_is_center && to == center.id {
                    if let Some(leaf) = leaf_map.get(&from) {
                        if (edge.predicate)(center, leaf) {
                            matched.insert(from);
                        }
                    }
                }
            }
            if matched.is_empty() {
                continue 'centers;
            }
            leaf_sets.push(matched.iter().map(|id| &leaf_map[id]).collect());
        }

        // odometer over the leaf sets, last edge fastest
        let mut indices = vec![0usize; leaf_sets.len()];
        loop {
            let mut fields = Vec::with_capacity(1 + leaf_sets.len());
            fields.push(center.object.clone());
            for (set, &index) in leaf_sets.iter().zip(&indices) {
                fields.push(set[index].object.clone());
            }
            sink(Object::structure_of(row_class.clone(), fields)?)?;
            rows += 1;

            let mut position = indices.len();
            loop {
                if position == 0 {
                    break;
                }
                position -= 1;
                indices[position] += 1;
                if indices[position] < leaf_sets[position].len() {
                    break;
                }
                indices[position] = 0;
            }
            if indices.iter().all(|&i| i == 0) {
                break;
            }
        }
    }

    debug!(rows, "pattern match finished");
    Ok(())
}

fn collect_all(alloc: &mut PageAllocator, class: &Arc<Class>) -> Result<Vec<NodeRecord>> {
    open_store(alloc, class)?.collect_if(&mut |_| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;

    fn point_class() -> Arc<Class> {
        let x = Class::primitive(PrimitiveKind::Double, "x").expect("class");
        let y = Class::primitive(PrimitiveKind::Double, "y").expect("class");
        Class::structure("point", vec![x, y]).expect("class")
    }

    #[test]
    fn edge_must_be_a_relation() {
        let point = point_class();
        let mut pattern = Pattern::new(point.clone());
        assert!(matches!(
            pattern.add_relation(point, |_, _| true),
            Err(DbError::BadArgument(_))
        ));
    }

    #[test]
    fn edge_must_touch_the_center() {
        let point = point_class();
        let name = Class::string("name").expect("class");
        let likes =
            Class::relation("likes", name.clone(), name.clone(), Vec::new()).expect("class");

        let mut pattern = Pattern::new(point);
        assert!(matches!(
            pattern.add_relation(likes, |_, _| true),
            Err(DbError::BadArgument(_))
        ));
    }

    #[test]
    fn leaf_class_picks_the_far_side() {
        let point = point_class();
        let name = Class::string("name").expect("class");
        let labeled =
            Class::relation("labeled", point.clone(), name.clone(), Vec::new()).expect("class");

        let mut pattern = Pattern::new(point.clone());
        pattern
            .add_relation(labeled, |_, _| true)
            .expect("add edge");
        let leaf = pattern.edges()[0].leaf_class(&point.serialize());
        assert_eq!(leaf.serialize(), name.serialize());

        let self_edge =
            Class::relation("near", point.clone(), point.clone(), Vec::new()).expect("class");
        let mut pattern = Pattern::new(point.clone());
        pattern
            .add_relation(self_edge, |_, _| true)
            .expect("add edge");
        let leaf = pattern.edges()[0].leaf_class(&point.serialize());
        assert_eq!(leaf.serialize(), point.serialize());
    }
}
