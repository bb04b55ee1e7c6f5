//! Asserted-identity resolution.
//!
//! Turns one request's attributes into the values the host stores:
//! 1. Username: remote user → username rules → replacements → case
//! 2. Full name: display-name attribute → full-name rules → replacements
//! 3. Email: first value of the email attribute
//! 4. Desired roles: default roles ∪ roles discovered from every bound
//!    attribute

pub mod attributes;
pub mod outcome;
pub mod policy;
pub mod resolver;

pub use attributes::AttributeSet;
pub use outcome::AuthOutcome;
pub use policy::LoginPolicy;
pub use resolver::{IdentityResolver, ResolvedIdentity};
