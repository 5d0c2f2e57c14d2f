//! Email authentication evaluators: SPF, DKIM, DMARC, reverse-DNS
//! confirmation and DNS blocklists.
//!
//! All evaluators are pure over their inputs plus the injected resolver,
//! so the inbound analysis decision tree is unit-testable without a
//! network.

pub mod dkim;
pub mod dmarc;
pub mod dnsbl;
pub mod iprev;
pub mod spf;

pub use dkim::{DkimOutcome, DkimStatus};
pub use dmarc::{DmarcEvaluation, DmarcStatus};
pub use dnsbl::DnsblStatus;
pub use iprev::IprevStatus;
pub use spf::SpfStatus;
