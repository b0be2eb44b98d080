pub mod bal;
pub mod board;
pub mod boot;
pub mod broker;
pub mod command;
pub mod config;
pub mod dns;
pub mod drivers;
pub mod error;
pub mod identity;
pub mod portal;
pub mod store;
pub mod telemetry;
pub mod topics;

pub use bal::BoardHal;
pub use board::{BoardDescriptor, LedSlot, PwmSlot, RelaySlot, SensorKind, SensorSlot, ServoSlot};
pub use boot::{BootDecision, HaltReason, ProvisionReason};
pub use broker::{BrokerConfig, BrokerStats, QosLevel, SessionState};
pub use command::{Command, CommandResult, LedAction};
pub use config::{DeviceIdentity, NetworkCredentials, ServerConfig};
pub use drivers::{GpioBackend, SimBoard, SoftGpio};
pub use error::HalError;
pub use store::{MemoryStore, Store, StoreHandle, StoreMode};
