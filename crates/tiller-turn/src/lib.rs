pub mod coordinator;
pub mod correlator;
pub mod error;
pub mod events;
pub mod prompt;
pub mod registry;
pub mod title;

pub use coordinator::{TurnCoordinator, UserTurnRequest};
pub use error::TurnError;
pub use events::TurnEvent;
pub use registry::{TurnHandle, TurnRegistry};
