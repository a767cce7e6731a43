pub mod queue;
pub mod writer;

pub use queue::{ingestion_queue, IngestionSender};
pub use writer::ForwardingWriter;
