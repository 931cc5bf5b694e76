//! Dev-only test harness for `wire-session`: an in-memory [`Connection`]
//! pair plus a manually-advanceable [`Clock`], generalizing the reference
//! stack's own `rt-test-utils` mock WS client/server. Not shipped to
//! consumers of the framework.

pub mod clock;
pub mod connection;

pub use clock::TestClock;
pub use connection::{InMemoryConnection, InMemoryNetwork};
