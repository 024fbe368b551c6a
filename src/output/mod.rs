pub mod analyzer;
pub mod display;
pub mod formatters;
pub mod sink;

pub use analyzer::{AnalysisSummary, ExportFormat, FieldStats, Summary};
pub use display::ConsoleDisplay;
pub use formatters::{CsvFormatter, JsonLinesFormatter, SampleFormatter, TextFormatter};
pub use sink::{RecordLogger, SinkHandle, SinkReport};
