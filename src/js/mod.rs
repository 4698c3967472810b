pub mod channel;
pub mod console;
mod runtime;
pub(crate) mod sandbox;
pub mod script;
pub mod serializer;
pub mod timers;

pub use channel::{ListenerId, Message, MessageChannel, PortChannel};
pub use console::{ConsoleLevel, ConsoleSink, TracingConsole};
pub use script::ScriptLoadTiming;
pub use serializer::{Boundary, BoundaryValue, ForeignObject, ForeignProperty, HostFunction};
pub use timers::{TimerId, TimerKind, TimerRegistry};
