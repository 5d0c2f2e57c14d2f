//! merel-core: inbound mail analysis and outbound delivery.
//!
//! This crate provides the decision engine for incoming SMTP deliveries
//! (authentication evaluators, reputation, content classification,
//! subjectpass), the persistent delivery queue with its scheduler, report
//! ingestion (DMARC aggregate, TLS-RPT), MTA-STS policy retrieval and the
//! administrative control socket.

pub mod analyze;
pub mod ctl;
pub mod dmarcrpt;
pub mod email_auth;
pub mod mtasts;
pub mod queue;
pub mod reportdb;
pub mod reputation;
pub mod subjectpass;
pub mod tlsrpt;

pub use analyze::{analyze, Analysis, Delivery};
pub use ctl::{CtlClient, CtlServer};
pub use email_auth::{DkimOutcome, DkimStatus, DmarcEvaluation, DmarcStatus, IprevStatus, SpfStatus};
pub use queue::{DeliveryAgent, DeliveryResult, Queue, QueueFilter, QueueMessage, Scheduler, SmtpAgent};
pub use reportdb::{DmarcReportStore, MtastsCache, TlsReportStore};
pub use reputation::{reputation, Reputation, ReputationMethod};
