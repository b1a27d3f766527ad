//! The set of supervised printers.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Config, PrinterConfig};
use crate::coordinator::{self, CoordinatorHandle, CoordinatorOptions};
use crate::session::{Connector, SessionSettings, WsConnector};

/// One coordinator per configured printer, keyed by printer id. Built once
/// at startup and never mutated afterwards.
#[derive(Clone, Default)]
pub struct Fleet {
    printers: BTreeMap<String, CoordinatorHandle>,
}

impl Fleet {
    /// Spawn a coordinator for every printer in `config`, each connecting
    /// over its own WebSocket connector.
    pub fn start(config: &Config) -> Self {
        Self::start_with(config, |printer| -> Arc<dyn Connector> { Arc::new(WsConnector::for_printer(printer)) })
    }

    /// Like [`Fleet::start`], with the connector for each printer chosen by
    /// `connector_for`.
    pub fn start_with<F>(config: &Config, connector_for: F) -> Self
    where
        F: Fn(&PrinterConfig) -> Arc<dyn Connector>,
    {
        let http = reqwest::Client::new();
        let printers = config
            .printers
            .iter()
            .map(|printer| {
                let options = CoordinatorOptions {
                    session: SessionSettings::from(&config.session),
                    command_timeout: config.session.command_timeout(),
                    connector: connector_for(printer),
                    http: http.clone(),
                    helper_url: config.stream_helper.url.clone(),
                    helper_recheck: config.stream_helper.recheck(),
                };
                let handle = coordinator::spawn(printer.clone(), options);
                (printer.id.clone(), handle)
            })
            .collect::<BTreeMap<_, _>>();
        tracing::info!(printers = printers.len(), "fleet started");
        Self { printers }
    }

    pub fn get(&self, id: &str) -> Option<&CoordinatorHandle> {
        self.printers.get(id)
    }

    /// Printers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &CoordinatorHandle> {
        self.printers.values()
    }

    pub fn len(&self) -> usize {
        self.printers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.printers.is_empty()
    }

    pub async fn shutdown_all(&self) {
        let closing = self.printers.values().map(|handle| handle.shutdown());
        futures_util::future::join_all(closing).await;
        tracing::info!("all printers closed");
    }
}
