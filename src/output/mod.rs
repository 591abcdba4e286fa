pub mod formatters;
pub mod payload;
pub mod senders;

pub use formatters::{
    create_formatter, ConsoleFormatter, CsvFormatter, DataFormatter, JsonFormatter,
};
pub use payload::{MessageType, PayloadBuilder, PayloadMetric, Publication, SparkplugPayload};
pub use senders::{ConsoleSender, DataSender, FileSender, MemorySender};
