pub mod formatter;

pub use formatter::{
    format_composite_table, format_elapsed, format_json, format_number, format_references,
    format_run_summary, format_tsv, should_use_colors,
};
