// src/core/scanner/mod.rs

// Built-in scan modules. Third-party modules implement the same `ScanModule`
// trait and register through `Engine::register_module`.
pub mod dns_scanner;
pub mod url_scanner;

use std::sync::Arc;

use crate::core::descriptor::ModuleDescriptor;
use crate::core::engine::Engine;
use crate::core::error::RegistrationError;
use crate::core::module::ModuleHandle;
use self::dns_scanner::DnsResolver;
use self::url_scanner::UrlSplitter;

/// Descriptor and implementation of every built-in module.
pub fn builtin() -> Vec<(ModuleDescriptor, ModuleHandle)> {
    vec![
        (UrlSplitter::descriptor(), Arc::new(UrlSplitter) as ModuleHandle),
        (DnsResolver::descriptor(), Arc::new(DnsResolver::new()) as ModuleHandle),
    ]
}

/// Registers and activates all built-in modules.
pub fn register_builtin(engine: &Engine) -> Result<(), RegistrationError> {
    for (descriptor, implementation) in builtin() {
        engine.register_module(descriptor, implementation)?;
    }
    Ok(())
}
