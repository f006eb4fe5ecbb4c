pub mod coalescer;
pub mod command;
pub mod hybrid;
pub mod process;
pub mod protocol;

pub use coalescer::{Coalescer, CoalescedEvent, MessageKind};
pub use command::{CommandSpec, CommandSpecError};
pub use hybrid::HybridLineBuffer;
pub use process::{ProcessError, ProcessManager, ProcessOutput, ProcessStatus};
pub use protocol::{SessionUpdate, ToolCallStatus};
