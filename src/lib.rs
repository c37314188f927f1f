pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod replay;
pub mod signing;
pub mod store;

pub use amount::{Cents, Liters};
pub use config::Config;
pub use engine::{Engine, EngineError};
pub use model::{Identity, MachineId, RechargeId, UserId};
pub use replay::{Command, Replay};
pub use store::{MemoryStore, Store};
