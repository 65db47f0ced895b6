pub mod backend;
pub mod class;
pub mod collector;
pub mod config;
pub mod constant;
pub mod descriptor;
pub mod error;
pub mod image;
pub mod interner;
pub mod layout;
pub mod module;
pub mod monitor;
pub mod session;
pub mod threading;
pub mod vtable;

pub use jolt_object::{
    ARRAY_ELEMENTS_OFFSET, ARRAY_LENGTH_OFFSET, CLASS_OFFSET, HEADER_SIZE, LOCK_OFFSET,
    LockState, ObjectHeader, ObjectRef, POINTER_SIZE, VTABLE_OFFSET,
};

pub use class::{ClassId, ClassTable, ResolvedClass, RuntimeClass};
pub use collector::{Collector, SystemCollector};
pub use config::{Mode, SessionConfig};
pub use constant::{ConstRef, Constant};
pub use error::{ImageError, MonitorError, Result, RuntimeError};
pub use module::{AotModule, LoadedModule, LoaderInit};
pub use session::{Session, SessionStats};
