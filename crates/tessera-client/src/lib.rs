//! # tessera-client: appending to and reading the Tessera ledger
//!
//! A [`LedgerClient`] signs each request, sends it to every replica over
//! its own perfect link and waits until `f+1` replicas agree on the
//! outcome. Unanswered requests are resent with the same nonce; replicas
//! recognise the retry and never order it twice.
//!
//! ```ignore
//! let mut client = LedgerClient::bind(id, key, roster, ClientSettings::default()).await?;
//! client.append("tx1").await?;
//! let blocks = client.read().await?;
//! ```

mod client;
mod error;
mod tally;

pub use client::{ClientSettings, LedgerClient};
pub use error::{ClientError, ClientResult};
pub use tally::{Answer, ResponseTally};
