//! Delivery transports.
//!
//! The scheduler talks to a [`DeliveryAgent`] so attempts are testable
//! without a network. The production agent delivers over SMTP: direct to
//! the recipient domain's MX hosts, via a configured submission relay, or
//! to nowhere for the null transport.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use merel_common::dns::Resolver;
use merel_common::types::EmailAddress;
use tracing::{debug, info, warn};

use crate::mtasts;
use crate::reportdb::MtastsCache;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    /// 4xx-class trouble; retry later.
    Temporary(String),
    /// 5xx-class refusal; give up and return a DSN.
    Permanent(String),
}

/// Something that can attempt delivery of one message.
#[async_trait]
pub trait DeliveryAgent: Send + Sync {
    async fn deliver(
        &self,
        transport: &str,
        sender: Option<&EmailAddress>,
        recipient: &EmailAddress,
        data: &[u8],
    ) -> DeliveryResult;
}

/// SMTP delivery: direct MX, submission relay, or null.
pub struct SmtpAgent {
    resolver: Arc<dyn Resolver>,
    hostname: String,
    /// Relay for the "submission" transport.
    relay: Option<(String, u16)>,
    /// MTA-STS policy cache; with an enforced policy, only allowed MX
    /// hosts are attempted.
    mtasts: Option<Arc<MtastsCache>>,
}

impl SmtpAgent {
    pub fn new(resolver: Arc<dyn Resolver>, hostname: String, relay: Option<(String, u16)>) -> Self {
        Self {
            resolver,
            hostname,
            relay,
            mtasts: None,
        }
    }

    pub fn with_mtasts(mut self, cache: Arc<MtastsCache>) -> Self {
        self.mtasts = Some(cache);
        self
    }

    fn envelope(
        sender: Option<&EmailAddress>,
        recipient: &EmailAddress,
    ) -> Result<lettre::address::Envelope, String> {
        let from = sender
            .map(|s| {
                lettre::Address::new(&s.localpart, &s.domain)
                    .map_err(|e| format!("sender address: {}", e))
            })
            .transpose()?;
        let to = lettre::Address::new(&recipient.localpart, &recipient.domain)
            .map_err(|e| format!("recipient address: {}", e))?;
        lettre::address::Envelope::new(from, vec![to]).map_err(|e| format!("envelope: {}", e))
    }

    async fn send_to_host(
        &self,
        host: &str,
        port: u16,
        envelope: &lettre::address::Envelope,
        data: &[u8],
    ) -> Result<(), (bool, String)> {
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .hello_name(ClientId::Domain(self.hostname.clone()))
            .build();
        match mailer.send_raw(envelope, data).await {
            Ok(_) => Ok(()),
            Err(e) => Err((e.is_permanent(), e.to_string())),
        }
    }

    async fn deliver_direct(
        &self,
        sender: Option<&EmailAddress>,
        recipient: &EmailAddress,
        data: &[u8],
    ) -> DeliveryResult {
        let envelope = match Self::envelope(sender, recipient) {
            Ok(e) => e,
            Err(e) => return DeliveryResult::Permanent(e),
        };

        let mut hosts: Vec<String> = match self.resolver.lookup_mx(&recipient.domain).await {
            Ok(records) => records.into_iter().map(|r| r.host).collect(),
            Err(e) if e.is_not_found() => {
                // Implicit MX: the domain itself.
                vec![recipient.domain.clone()]
            }
            Err(e) => return DeliveryResult::Temporary(format!("mx lookup: {}", e)),
        };

        if let Some(cache) = &self.mtasts {
            match cache.get(self.resolver.as_ref(), &recipient.domain).await {
                Ok(Some(policy)) if policy.mode == mtasts::Mode::Enforce => {
                    hosts.retain(|h| policy.matches(h));
                    if hosts.is_empty() {
                        return DeliveryResult::Temporary(
                            "no mx host allowed by mta-sts policy".to_string(),
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Without a usable policy the domain is treated as not
                    // implementing MTA-STS.
                    warn!(domain = %recipient.domain, error = %e, "mta-sts policy unavailable");
                }
            }
        }

        let mut last_error = String::from("no mx hosts");
        for host in hosts {
            debug!(host, recipient = %recipient, "attempting smtp delivery");
            match self.send_to_host(&host, 25, &envelope, data).await {
                Ok(()) => {
                    info!(host, recipient = %recipient, "delivered");
                    return DeliveryResult::Delivered;
                }
                Err((true, e)) => {
                    warn!(host, error = %e, "permanent delivery failure");
                    return DeliveryResult::Permanent(e);
                }
                Err((false, e)) => {
                    warn!(host, error = %e, "temporary delivery failure, trying next host");
                    last_error = e;
                }
            }
        }
        DeliveryResult::Temporary(last_error)
    }
}

#[async_trait]
impl DeliveryAgent for SmtpAgent {
    async fn deliver(
        &self,
        transport: &str,
        sender: Option<&EmailAddress>,
        recipient: &EmailAddress,
        data: &[u8],
    ) -> DeliveryResult {
        match transport {
            "null" => {
                info!(recipient = %recipient, "null transport, discarding");
                DeliveryResult::Delivered
            }
            "submission" => {
                let Some((host, port)) = &self.relay else {
                    return DeliveryResult::Temporary("no submission relay configured".to_string());
                };
                let envelope = match Self::envelope(sender, recipient) {
                    Ok(e) => e,
                    Err(e) => return DeliveryResult::Permanent(e),
                };
                match self.send_to_host(host, *port, &envelope, data).await {
                    Ok(()) => DeliveryResult::Delivered,
                    Err((true, e)) => DeliveryResult::Permanent(e),
                    Err((false, e)) => DeliveryResult::Temporary(e),
                }
            }
            "" | "direct" => self.deliver_direct(sender, recipient, data).await,
            other => DeliveryResult::Permanent(format!("unknown transport {:?}", other)),
        }
    }
}

/// Scripted agent for tests: pops pre-programmed results and records the
/// deliveries it was asked to make.
#[cfg(test)]
pub struct RecordingAgent {
    pub script: std::sync::Mutex<std::collections::VecDeque<DeliveryResult>>,
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl RecordingAgent {
    pub fn new(script: Vec<DeliveryResult>) -> Arc<Self> {
        Arc::new(Self {
            script: std::sync::Mutex::new(script.into()),
            calls: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
#[async_trait]
impl DeliveryAgent for RecordingAgent {
    async fn deliver(
        &self,
        transport: &str,
        _sender: Option<&EmailAddress>,
        recipient: &EmailAddress,
        _data: &[u8],
    ) -> DeliveryResult {
        self.calls
            .lock()
            .unwrap()
            .push((transport.to_string(), recipient.to_string()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DeliveryResult::Delivered)
    }
}
