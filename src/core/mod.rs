pub mod adapter;
pub mod connection;
pub mod namespace;
pub mod packet;
pub mod room;
pub mod server;
pub mod task;

pub use adapter::LocalAdapter;
pub use connection::Connection;
pub use namespace::{EventHandler, Middleware, Namespace};
pub use packet::{BroadcastPacket, BroadcastScope, Metadata, Origin, Packet};
pub use room::Room;
pub use server::Server;
pub use task::ScheduledTask;
