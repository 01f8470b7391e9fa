//! Oracle read surface
//!
//! The request/response shapes of the price query endpoint and the client
//! handle the consensus application uses to reach it. The engine implements
//! the service in-process; the transport boundary (gRPC) lives outside the
//! core and consumes these same types.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::oracle::Oracle;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryPricesRequest;

/// Prices keyed by canonical pair string; values are the base-10 decimal
/// rendering of the 256-bit price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPricesResponse {
    pub prices: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait OracleService: Send + Sync {
    async fn prices(&self, req: QueryPricesRequest) -> Result<QueryPricesResponse>;
}

#[async_trait]
impl OracleService for Oracle {
    /// The latest snapshot. Before the first aggregation completes this is an
    /// empty map stamped with the current time.
    async fn prices(&self, _req: QueryPricesRequest) -> Result<QueryPricesResponse> {
        match self.latest_snapshot() {
            Some(snapshot) => Ok(QueryPricesResponse {
                prices: snapshot
                    .prices
                    .iter()
                    .map(|(pair, price)| (pair.to_string(), price.to_string()))
                    .collect(),
                timestamp: snapshot.computed_at,
            }),
            None => Ok(QueryPricesResponse {
                prices: BTreeMap::new(),
                timestamp: Utc::now(),
            }),
        }
    }
}

/// Client handle for the oracle service. Must be started before use and
/// stopped on shutdown; every call carries the configured deadline, which
/// also bounds any wait for the service to become ready.
pub struct OracleClient {
    service: Mutex<Option<Arc<dyn OracleService>>>,
    timeout: Duration,
}

impl OracleClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            service: Mutex::new(None),
            timeout,
        }
    }

    pub fn start(&self, service: Arc<dyn OracleService>) {
        *self.service.lock().expect("client lock poisoned") = Some(service);
    }

    pub fn stop(&self) {
        *self.service.lock().expect("client lock poisoned") = None;
    }

    pub async fn prices(&self, req: QueryPricesRequest) -> Result<QueryPricesResponse> {
        let service = {
            let guard = self.service.lock().expect("client lock poisoned");
            match guard.as_ref() {
                Some(service) => Arc::clone(service),
                None => bail!("oracle client not started"),
            }
        };

        tokio::time::timeout(self.timeout, service.prices(req))
            .await
            .context("price query deadline exceeded")?
    }
}
