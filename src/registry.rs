use std::sync::Arc;
use tracing::info;

use crate::{
    client_pool::{ServiceClientPool, ShutdownReport},
    print_cache::DocumentPrintCache,
};

/// Shared delegation state: the pooled service clients and the document
/// print cache. Built once when the gateway starts and handed to every
/// executor; torn down with [`DelegationRegistry::shutdown`].
pub struct DelegationRegistry {
    pub clients: ServiceClientPool,
    pub print_cache: DocumentPrintCache,
}

impl DelegationRegistry {
    pub fn new(pipelining_depth: usize) -> Arc<Self> {
        Arc::new(DelegationRegistry {
            clients: ServiceClientPool::new(pipelining_depth),
            print_cache: DocumentPrintCache::new(),
        })
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.clients.shutdown().await;
        self.print_cache.clear();
        info!(
            closed = report.closed,
            failed = report.failed,
            "delegation registry shut down"
        );
        report
    }
}
