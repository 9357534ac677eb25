mod broadcasts;
mod delivery;
mod directory;
mod dispatcher;
mod dlt;
mod lifecycle;
mod targeting;

pub use broadcasts::BroadcastService;
pub use delivery::DeliveryService;
pub use directory::{DirectoryError, HttpUserDirectory, ResilientDirectory, UserDirectory};
pub use dispatcher::{
    handle_event, DispatchError, DispatchErrorKind, Dispatcher, DispatcherContext,
    FAIL_ME_SENTINEL,
};
pub use dlt::DltService;
pub use lifecycle::{daily_with_lease, every_with_lease, LifecycleController};
pub use targeting::TargetingService;
