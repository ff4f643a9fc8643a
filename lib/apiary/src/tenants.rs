// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The tenant registry.
//!
//! Tenants are keyed by name and looked up per request from the `Host`
//! header. The registry ingests the JSON configuration file and owns every
//! [`TenantInstance`] for the lifetime of the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use slog::{error, info, Logger};

use crate::config::{parse_tenants, ConfigError, ServerSettings, TenantConfig};
use crate::tenant::TenantInstance;
use crate::vmm::Vmm;

pub struct Tenants {
    tenants: BTreeMap<String, Arc<TenantInstance>>,
    vmm: Arc<dyn Vmm>,
    settings: Arc<ServerSettings>,
    log: Logger,
    default_name: String,
}

impl Tenants {
    pub fn new(
        vmm: Arc<dyn Vmm>,
        settings: Arc<ServerSettings>,
        log: Logger,
    ) -> Self {
        let default_name = settings.default_tenant.clone();
        Self {
            tenants: BTreeMap::new(),
            vmm,
            settings,
            log,
            default_name,
        }
    }

    /// Loads tenants from a configuration file on disk.
    pub fn init_file(
        &mut self,
        path: &str,
        initialize: bool,
    ) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)?;
        self.init_json(path, &text, initialize)
    }

    /// Loads tenants from a configuration document. `source` names the
    /// origin for logging only.
    pub fn init_json(
        &mut self,
        source: &str,
        text: &str,
        initialize: bool,
    ) -> Result<(), ConfigError> {
        let loaded = parse_tenants(text, &self.settings)?;
        if let Some(default) = loaded.default_tenant {
            self.default_name = default;
        }
        for config in loaded.tenants {
            let eager = initialize || config.start;
            self.load_tenant(config, eager);
        }
        info!(self.log, "tenant configuration loaded";
            "source" => source,
            "tenants" => self.tenants.len(),
            "default" => %self.default_name);

        if initialize {
            self.wait_for_all();
        }
        Ok(())
    }

    /// Registers one tenant. Duplicate names keep the first definition.
    pub fn load_tenant(&mut self, config: TenantConfig, initialize: bool) -> bool {
        let name = config.name.clone();
        if self.tenants.contains_key(&name) {
            error!(self.log, "tenant already exists, cannot create again";
                "tenant" => %name);
            return false;
        }
        let tenant = TenantInstance::new(
            config,
            Arc::clone(&self.vmm),
            &self.log,
            initialize,
        );
        self.tenants.insert(name, tenant);
        true
    }

    /// Blocks until every started tenant finished initializing. Failures
    /// are recoverable: the tenant answers 500 until a successful update.
    pub fn wait_for_all(&self) {
        for tenant in self.tenants.values() {
            if let Some(prog) = tenant.current_program() {
                if let Err(e) = prog.wait_for_initialization() {
                    error!(self.log, "tenant failed to initialize";
                        "tenant" => %tenant.config.name, "error" => %e);
                }
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Arc<TenantInstance>> {
        self.tenants.get(name)
    }

    /// Looks a tenant up by name, requiring its live-update key to match.
    pub fn find_key(&self, name: &str, key: &str) -> Option<&Arc<TenantInstance>> {
        self.tenants
            .get(name)
            .filter(|t| !t.config.key.is_empty() && t.config.key == key)
    }

    pub fn default_tenant(&self) -> Option<&Arc<TenantInstance>> {
        self.tenants.get(&self.default_name)
    }

    pub fn foreach(&self, mut f: impl FnMut(&Arc<TenantInstance>)) {
        for tenant in self.tenants.values() {
            f(tenant);
        }
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// The `/stats` document: one entry per tenant with a loaded program.
    pub fn gather_stats(&self) -> Value {
        let mut root = Map::new();
        for tenant in self.tenants.values() {
            tenant.gather_stats(&mut root);
        }
        Value::Object(root)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vmm::emulate::EmuVmm;

    fn registry() -> Tenants {
        let log = Logger::root(slog::Discard, slog::o!());
        let settings =
            Arc::new(ServerSettings { concurrency: Some(1), ..Default::default() });
        Tenants::new(EmuVmm::with_demo_guests(), settings, log)
    }

    #[test]
    fn registry_loads_and_finds_tenants() {
        let mut tenants = registry();
        tenants
            .init_json(
                "test",
                r#"{
                    "a.com": { "filename": "/nonexistent/a", "key": "k1" },
                    "b.com": { "filename": "/nonexistent/b", "default": true }
                }"#,
                false,
            )
            .unwrap();
        assert_eq!(tenants.len(), 2);
        assert!(tenants.find("a.com").is_some());
        assert!(tenants.find("missing.com").is_none());
        assert_eq!(
            tenants.default_tenant().unwrap().config.name.as_str(),
            "b.com"
        );
        assert!(tenants.find_key("a.com", "k1").is_some());
        assert!(tenants.find_key("a.com", "wrong").is_none());
        assert!(tenants.find_key("b.com", "").is_none());
    }

    #[test]
    fn duplicate_tenants_are_rejected() {
        let mut tenants = registry();
        tenants
            .init_json("t", r#"{ "a.com": { "filename": "/x" } }"#, false)
            .unwrap();
        tenants
            .init_json("t", r#"{ "a.com": { "filename": "/y" } }"#, false)
            .unwrap();
        assert_eq!(tenants.len(), 1);
    }
}
