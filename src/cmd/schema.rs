//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json_pretty,
    jobs::workspace::JobManifest,
    ocr::DocumentResult,
    prelude::*,
    server::JobStatusResponse,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// OCR output, as printed by `extract` and stored as `ocr.json`.
    DocumentResult,
    /// A job's `job.json`.
    JobManifest,
    /// The body of `GET /api/jobs/:id`.
    JobStatusResponse,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::DocumentResult => schema_for!(DocumentResult),
        SchemaType::JobManifest => schema_for!(JobManifest),
        SchemaType::JobStatusResponse => schema_for!(JobStatusResponse),
    };
    write_json_pretty(schema_opts.output_path.as_deref(), &schema).await
}
