mod scheduler;
mod sequence;
mod transport;

pub use scheduler::{BlockInfo, BlockReport, Scheduler, loop_periods};
pub use sequence::{PortWriter, Registry, Sequencable, Span};
pub use transport::{Transport, TransportClock};
