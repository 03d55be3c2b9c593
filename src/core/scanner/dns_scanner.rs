// src/core/scanner/dns_scanner.rs

use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::core::descriptor::{CapabilityFlag, ModuleDescriptor, ModuleVersion};
use crate::core::error::ModuleError;
use crate::core::models::{Emission, ScanEvent};
use crate::core::module::{ModuleContext, ScanModule};

pub const MODULE_ID: &str = "dns_resolver";

/// Resolves host names to addresses and reports the domain they belong to.
#[derive(Default)]
pub struct DnsResolver {
    resolver: OnceCell<TokioAsyncResolver>,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared async resolver, built on first use.
    fn resolver(&self) -> &TokioAsyncResolver {
        self.resolver
            .get_or_init(|| TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()))
    }

    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(MODULE_ID, ModuleVersion::new(1, 0, 0))
            .named("DNS Resolver")
            .summary("Resolves host names to IP addresses over DNS.")
            .watches("INTERNET_NAME")
            .produces("IP_ADDRESS")
            .produces("DOMAIN_NAME")
            .option("strip_www", true, "Report 'example.com' as the domain of 'www.example.com'.")
            .flag(CapabilityFlag::RequiresNetwork)
    }
}

#[async_trait]
impl ScanModule for DnsResolver {
    async fn setup(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.resolver();
        debug!("DNS resolver initialized.");
        Ok(())
    }

    /// Looks up every address of the host in `event`.
    ///
    /// # Returns
    /// One `IP_ADDRESS` per distinct address and one `DOMAIN_NAME`. A name that
    /// does not resolve is a finding, not a failure, so only the domain is
    /// reported for it.
    async fn handle(&self, event: &ScanEvent, ctx: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
        let host = event.data.trim_end_matches('.');
        let strip_www = ctx.option_bool("strip_www").unwrap_or(true);

        let mut emissions = vec![Emission::new("DOMAIN_NAME", domain_of(host, strip_www))];

        let lookup = tokio::select! {
            _ = ctx.cancelled() => return Err(ModuleError::new("lookup cancelled")),
            result = self.resolver().lookup_ip(host) => result,
        };
        let addresses: BTreeSet<IpAddr> = match lookup {
            Ok(response) => response.iter().collect(),
            Err(err) => {
                debug!(host, error = %err, "Host did not resolve.");
                BTreeSet::new()
            }
        };

        info!(host, addresses = addresses.len(), "Host resolved.");
        emissions.extend(addresses.into_iter().map(|ip| Emission::new("IP_ADDRESS", ip.to_string())));
        Ok(emissions)
    }
}

/// Strips a leading `www.` when asked to, matching how the rest of the
/// scanner queries the root domain.
fn domain_of(host: &str, strip_www: bool) -> String {
    let host = host.to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) if strip_www && !stripped.is_empty() => stripped.to_string(),
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::OptionValue;
    use crate::core::models::ScanTarget;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context(strip_www: bool) -> ModuleContext {
        ModuleContext::new(
            Uuid::new_v4(),
            MODULE_ID,
            Arc::new(ScanTarget::parse("example.com").expect("target")),
            Arc::new(BTreeMap::from([("strip_www".to_string(), OptionValue::Bool(strip_www))])),
            CancellationToken::new(),
        )
    }

    #[rstest]
    #[case("www.example.com", true, "example.com")]
    #[case("www.example.com", false, "www.example.com")]
    #[case("MAIL.Example.com", true, "mail.example.com")]
    #[case("www.", true, "www.")]
    fn derives_domain_names(#[case] host: &str, #[case] strip: bool, #[case] expected: &str) {
        assert_eq!(domain_of(host, strip), expected);
    }

    #[test]
    fn descriptor_is_valid() {
        DnsResolver::descriptor().validate().expect("valid descriptor");
    }

    #[tokio::test]
    async fn setup_builds_the_shared_resolver() {
        let module = DnsResolver::new();
        assert!(module.resolver.get().is_none());
        module.setup(&context(true)).await.expect("setup");
        assert!(module.resolver.get().is_some());
    }

    #[tokio::test]
    async fn literal_addresses_resolve_without_network() {
        let event = ScanEvent::seed("INTERNET_NAME", "127.0.0.1");
        let emissions = DnsResolver::new().handle(&event, &context(true)).await.expect("handled");
        assert!(emissions.contains(&Emission::new("IP_ADDRESS", "127.0.0.1")));
        assert!(emissions.contains(&Emission::new("DOMAIN_NAME", "127.0.0.1")));
    }
}
