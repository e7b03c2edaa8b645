use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::normalize::{DetailHit, ScopedProperty};
use crate::provider::{ProviderClient, RawCityRecord, StayWindow};

/// Listing search text tied to the stored city it was generated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyQuery {
    pub city_id: String,
    pub text: String,
}

impl fmt::Display for PropertyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Bounded fan-out of provider searches with fan-in into one accumulator.
///
/// The semaphore caps in-flight calls; pacing is left to the client's
/// rate limiter. A failing query never stops the others: failures are
/// collected and reported together once every worker has finished.
pub struct FetchOrchestrator {
    client: Arc<ProviderClient>,
    concurrency: usize,
}

type QueryFailure = (String, AppError);

impl FetchOrchestrator {
    pub fn new(client: ProviderClient, concurrency: usize) -> Self {
        Self {
            client: Arc::new(client),
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    pub async fn process_queries(
        &self,
        queries: &[String],
        cancel: &CancellationToken,
    ) -> AppResult<Vec<RawCityRecord>> {
        self.fan_out(queries.to_vec(), cancel, |client, query, cancel| async move {
            client.search_cities(&query, &cancel).await
        })
        .await
    }

    pub async fn process_property_queries(
        &self,
        queries: Vec<PropertyQuery>,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<ScopedProperty>> {
        self.fan_out(queries, cancel, |client, query, cancel| async move {
            let records = client.search_properties(&query.text, &cancel).await?;
            Ok(records
                .into_iter()
                .map(|record| ScopedProperty {
                    city_id: query.city_id.clone(),
                    record,
                })
                .collect())
        })
        .await
    }

    /// One detail and one photo call per listing, both paced by the limiter.
    pub async fn process_detail_queries(
        &self,
        property_ids: Vec<String>,
        window: StayWindow,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<DetailHit>> {
        self.fan_out(property_ids, cancel, move |client, property_id, cancel| async move {
            let details = client
                .fetch_property_details(&property_id, &window, &cancel)
                .await?;
            let photos = client.fetch_property_photos(&property_id, &cancel).await?;
            Ok(vec![DetailHit {
                property_id,
                details,
                photos,
            }])
        })
        .await
    }

    async fn fan_out<Q, T, F, Fut>(
        &self,
        queries: Vec<Q>,
        cancel: &CancellationToken,
        work: F,
    ) -> AppResult<Vec<T>>
    where
        Q: fmt::Display + Send + 'static,
        T: Send + 'static,
        F: Fn(Arc<ProviderClient>, Q, CancellationToken) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = AppResult<Vec<T>>> + Send + 'static,
    {
        let total = queries.len();
        info!(total, concurrency = self.concurrency, "dispatching provider queries");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let accumulator: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
        let mut workers: JoinSet<Result<(), QueryFailure>> = JoinSet::new();

        for query in queries {
            // Blocks here while every slot is taken.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|err| AppError::Join(err.to_string()))?
                }
            };

            let label = query.to_string();
            let client = Arc::clone(&self.client);
            let cancel = cancel.clone();
            let accumulator = Arc::clone(&accumulator);
            let work = work.clone();
            workers.spawn(async move {
                let _permit = permit;
                let records = match work(client, query, cancel).await {
                    Ok(records) => records,
                    Err(err) => return Err((label, err)),
                };
                let count = records.len();
                accumulator.lock().extend(records);
                debug!(query = %label, count, "query collected");
                Ok(())
            });
        }

        let mut causes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((_, err))) if err.is_cancelled() => {}
                Ok(Err((label, err))) => {
                    warn!(query = %label, error = %err, "provider query failed");
                    causes.push(format!("query '{label}': {err}"));
                }
                Err(err) => {
                    warn!(error = %err, "provider worker aborted");
                    causes.push(format!("worker task failed: {err}"));
                }
            }
        }

        if cancel.is_cancelled() {
            info!(total, "provider queries cancelled");
            return Err(AppError::Cancelled);
        }
        if !causes.is_empty() {
            return Err(AppError::Aggregate {
                failed: causes.len(),
                total,
                causes,
            });
        }

        let records = std::mem::take(&mut *accumulator.lock());
        info!(total, records = records.len(), "provider queries completed");
        Ok(records)
    }
}
