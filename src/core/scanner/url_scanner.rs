// src/core/scanner/url_scanner.rs

use async_trait::async_trait;
use tracing::debug;
use url::{Host, Url};

use crate::core::descriptor::{ModuleDescriptor, ModuleVersion};
use crate::core::error::ModuleError;
use crate::core::models::{Emission, ScanEvent};
use crate::core::module::{ModuleContext, ScanModule};

pub const MODULE_ID: &str = "url_splitter";

/// Extracts the host part of URLs.
pub struct UrlSplitter;

impl UrlSplitter {
    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(MODULE_ID, ModuleVersion::new(1, 0, 0))
            .named("URL Splitter")
            .summary("Reports the host of every URL as an internet name or IP address.")
            .watches("URL")
            .produces("INTERNET_NAME")
            .produces("IP_ADDRESS")
    }
}

#[async_trait]
impl ScanModule for UrlSplitter {
    async fn handle(&self, event: &ScanEvent, _ctx: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
        let url = Url::parse(&event.data).map_err(|e| ModuleError::from_error(&e))?;
        let emission = match url.host() {
            Some(Host::Domain(domain)) => {
                Emission::new("INTERNET_NAME", domain.trim_end_matches('.').to_ascii_lowercase())
            }
            Some(Host::Ipv4(ip)) => Emission::new("IP_ADDRESS", ip.to_string()),
            Some(Host::Ipv6(ip)) => Emission::new("IP_ADDRESS", ip.to_string()),
            None => {
                debug!(url = %event.data, "URL has no host.");
                return Ok(Vec::new());
            }
        };
        Ok(vec![emission])
    }
}
