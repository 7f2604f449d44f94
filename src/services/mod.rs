pub mod relay;

pub use relay::{ChatStreamRequest, RelayService, RelayStream};
