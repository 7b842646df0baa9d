//! RPC client.
//!
//! [`ConnectionFactory`] keeps one negotiated session to one server from a
//! candidate list, reconnecting and failing over in the background.
//! [`RequestCorrelator`] matches responses to outstanding calls by
//! correlation id and times out calls that never get one.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sockrpc::client::{CallOptions, ClientConfig, ConnectionFactory};
//! use sockrpc::codec::{Arguments, OperationKey, SchemaRegistry};
//!
//! let factory = ConnectionFactory::new(
//!     ClientConfig::default().with_addresses("10.0.0.1:7300,10.0.0.2:7300"),
//!     Arc::new(SchemaRegistry::new()),
//! )?;
//! factory.start().wait().await?;
//!
//! let key = OperationKey::new("Accounts", "1.0", "balance");
//! let returned = factory
//!     .call(&key, &Arguments::new().with("account", "acc-42"), CallOptions::new())
//!     .await?;
//! ```

mod config;
mod correlator;
mod factory;

pub use config::ClientConfig;
pub use correlator::{CallOptions, CallOutcome, ExecutionObserver, RequestCorrelator, TimeoutPolicy};
pub use factory::{AddressHealth, AddressStatus, ConnectionFactory, ConnectionStatus, StartHandle};
