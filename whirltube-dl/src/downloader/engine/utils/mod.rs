//! Utility modules for download tasks.

mod files;
mod output_record_reader;

pub use files::ensure_output_dir;
pub use output_record_reader::OutputRecordReader;
