pub mod http;
pub mod runtime;

pub use http::{DEFAULT_SERVER, RelayClient};
pub use runtime::{Client, ClientError, Command, Reply};
