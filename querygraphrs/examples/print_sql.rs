use std::{env, fs, path::PathBuf};

use querygraph::{logging, query_builder::SqlBuilder, storage::StoredModel, QueryGraphConfig};

fn usage() {
    eprintln!("Usage: print_sql <stored_model_json> [row_limit]");
    eprintln!("Example: cargo run --example print_sql -- demos/models/orders.json 100");
}

fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        usage();
        std::process::exit(1);
    }

    let model_path = PathBuf::from(args.remove(0));
    let requested = args.first().map(|s| s.parse::<u64>()).transpose()?;

    let stored: StoredModel = serde_json::from_str(&fs::read_to_string(model_path)?)?;
    let model = stored.into_model();

    let config = QueryGraphConfig::load_default();
    let limit = match model.connection_id.as_deref() {
        Some(id) => config.for_connection(id).query.effective_row_limit(requested),
        None => config.defaults.query.effective_row_limit(requested),
    };

    let Some(compiled) = SqlBuilder::new().compile_with_limit(&model, limit) else {
        eprintln!("model {} has no tables", model.id);
        std::process::exit(2);
    };
    println!("{}", compiled.sql);
    for warning in &compiled.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}
