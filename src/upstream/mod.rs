mod exchange;
mod pool;
mod resolver;
mod server;
mod worker;

#[cfg(test)]
pub mod testing;

pub use exchange::{Exchange, UdpExchange};
pub use pool::{Message, Pool};
pub use resolver::{MessageResult, Resolved, ResolveError};
pub use server::Server;
