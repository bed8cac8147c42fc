//! Adapter lookup table keyed by channel.

use outreach_core::config::ProvidersConfig;
use outreach_core::traits::ChannelAdapter;
use outreach_core::types::Channel;
use std::collections::HashMap;
use std::sync::Arc;

use crate::email::EmailAdapter;
use crate::instantly::InstantlyAdapter;
use crate::postmark::PostmarkAdapter;
use crate::push::PushAdapter;
use crate::sms::SmsAdapter;
use crate::vapi::VapiAdapter;

/// Channel → adapter. A channel with no active integration has no entry.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every active provider integration.
    pub fn from_config(providers: &ProvidersConfig) -> Self {
        let mut registry = Self::new();

        if let Some(vapi) = VapiAdapter::from_config(providers.vapi.as_ref()) {
            registry.register(Arc::new(vapi));
        }
        if let Some(sms) = SmsAdapter::from_config(providers.sms.as_ref()) {
            registry.register(Arc::new(sms));
        }
        let email = EmailAdapter::new(
            PostmarkAdapter::from_config(providers.postmark.as_ref()),
            InstantlyAdapter::from_config(providers.instantly.as_ref()),
        );
        if email.is_configured() {
            registry.register(Arc::new(email));
        }
        if let Some(push) = PushAdapter::from_config(providers.pwaflow.as_ref()) {
            registry.register(Arc::new(push));
        }

        let active: Vec<String> = registry
            .channels()
            .iter()
            .map(|c| format!("{}={}", c, registry.adapters[c].provider()))
            .collect();
        tracing::info!("🔌 Channel adapters: [{}]", active.join(", "));
        registry
    }

    /// Register (or replace) the adapter for its channel.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    /// Registered channels in canonical order.
    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.adapters.contains_key(c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::config::{PostmarkConfig, SmsConfig};

    #[test]
    fn only_active_integrations_register() {
        let providers = ProvidersConfig {
            sms: Some(SmsConfig {
                account_sid: "AC1".into(),
                auth_token: "t".into(),
                ..SmsConfig::default()
            }),
            postmark: Some(PostmarkConfig {
                server_token: "pm".into(),
                enabled: false,
                ..PostmarkConfig::default()
            }),
            ..ProvidersConfig::default()
        };
        let registry = AdapterRegistry::from_config(&providers);
        assert_eq!(registry.channels(), vec![Channel::Sms]);
        assert!(registry.get(Channel::Email).is_none());
        assert_eq!(registry.get(Channel::Sms).unwrap().provider(), "twilio");
    }
}
