//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. The deployment
//! network is the trust boundary; there is no request authentication.

pub mod agents;
pub mod health;
pub mod test;
