//! Command-line interface for nodum database files.

use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use nodum::{Class, Database, Literal, Object, OpenMode};

#[derive(Parser, Debug)]
#[command(
    name = "nodum",
    version,
    about = "Embedded graph/object database CLI",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Database file to operate on")]
    db: PathBuf,

    #[arg(
        long,
        value_enum,
        default_value_t = ModeArg::Default,
        help = "How to open the database file"
    )]
    mode: ModeArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Read,
    Write,
    Default,
}

impl From<ModeArg> for OpenMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Read => OpenMode::Read,
            ModeArg::Write => OpenMode::Write,
            ModeArg::Default => OpenMode::Default,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a fresh database file (clears existing contents).
    Init,

    /// List every registered class.
    Classes,

    /// Register a class given its serialized descriptor.
    AddClass {
        #[arg(value_name = "DESCRIPTOR")]
        descriptor: String,
    },

    /// Drop a class and all of its nodes.
    RemoveClass {
        #[arg(value_name = "DESCRIPTOR")]
        descriptor: String,
    },

    /// Check whether a class is registered.
    Contains {
        #[arg(value_name = "DESCRIPTOR")]
        descriptor: String,
    },

    /// Show the live node count of a class.
    Count {
        #[arg(value_name = "DESCRIPTOR")]
        descriptor: String,
    },

    /// Print every node of a class.
    Nodes {
        #[arg(value_name = "DESCRIPTOR")]
        descriptor: String,
    },

    /// Construct a node from literals and insert it.
    ///
    /// Literals are matched per class leaf: `true`/`false`, integers,
    /// floats, anything else as a string.
    AddNode {
        #[arg(value_name = "DESCRIPTOR")]
        descriptor: String,
        #[arg(value_name = "ARG", trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn parse_literal(token: &str) -> Literal {
    if token == "true" {
        return Literal::Bool(true);
    }
    if token == "false" {
        return Literal::Bool(false);
    }
    if let Ok(value) = token.parse::<i64>() {
        return Literal::Int(value);
    }
    if let Ok(value) = token.parse::<f64>() {
        return Literal::Float(value);
    }
    Literal::Str(token.to_owned())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mode = match &cli.command {
        Command::Init => OpenMode::Write,
        _ => cli.mode.into(),
    };
    let mut db = Database::open(&cli.db, mode)?;
    let mut out = io::stdout().lock();

    match cli.command {
        Command::Init => {
            writeln!(out, "initialized {}", cli.db.display())?;
        }
        Command::Classes => {
            db.print_all_classes(&mut out)?;
        }
        Command::AddClass { descriptor } => {
            let class = Class::parse(&descriptor)?;
            db.add_class(&class)?;
            writeln!(out, "added {}", class.serialize())?;
        }
        Command::RemoveClass { descriptor } => {
            let class = Class::parse(&descriptor)?;
            db.remove_class(&class)?;
            writeln!(out, "removed {}", class.serialize())?;
        }
        Command::Contains { descriptor } => {
            let class = Class::parse(&descriptor)?;
            writeln!(out, "{}", db.contains_class(&class)?)?;
        }
        Command::Count { descriptor } => {
            let class = Class::parse(&descriptor)?;
            writeln!(out, "{}", db.node_count(&class)?)?;
        }
        Command::Nodes { descriptor } => {
            let class = Class::parse(&descriptor)?;
            db.print_all_nodes(&class, &mut out)?;
        }
        Command::AddNode { descriptor, args } => {
            let class = Class::parse(&descriptor)?;
            let literals: Vec<Literal> = args.iter().map(|s| parse_literal(s)).collect();
            let object = Object::new(&class, literals)?;
            let id = db.add_node(&object)?;
            writeln!(out, "[ {id} ] {object}")?;
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
