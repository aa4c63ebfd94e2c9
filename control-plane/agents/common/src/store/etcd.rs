use crate::store::{
    ConnectSnafu, DeleteSnafu, DeserialiseValueSnafu, GetSnafu, StoreError, ValueStringSnafu,
};
use etcd_client::Client;
use serde_json::Value;
use snafu::ResultExt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Number of consecutive transport failures after which the breaker opens
const BREAKER_THRESHOLD: u32 = 3;
/// How long the breaker stays open before transport calls are allowed again
const BREAKER_WINDOW: Duration = Duration::from_secs(30);

/// etcd client with a circuit breaker over the transport.
/// Transport failures are counted; once the threshold is reached every call
/// fails fast with `StoreError::Unavailable` until the window expires.
pub struct Etcd {
    client: Mutex<Client>,
    breaker: Mutex<Breaker>,
}

#[derive(Default)]
struct Breaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl std::fmt::Debug for Etcd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Etcd").finish()
    }
}

impl Etcd {
    /// Connect to etcd on the given endpoint
    pub async fn new(endpoint: &str) -> Result<Etcd, StoreError> {
        let client = Client::connect([endpoint], None)
            .await
            .context(ConnectSnafu {})?;
        Ok(Etcd {
            client: Mutex::new(client),
            breaker: Mutex::new(Breaker::default()),
        })
    }

    async fn check_breaker(&self) -> Result<(), StoreError> {
        let mut breaker = self.breaker.lock().await;
        if let Some(open_until) = breaker.open_until {
            let now = Instant::now();
            if now < open_until {
                return Err(StoreError::Unavailable {
                    failures: breaker.consecutive_failures,
                    remaining: open_until - now,
                });
            }
            // window elapsed, probe again
            breaker.open_until = None;
        }
        Ok(())
    }

    async fn record_outcome(&self, failed: bool) {
        let mut breaker = self.breaker.lock().await;
        if failed {
            breaker.consecutive_failures += 1;
            if breaker.consecutive_failures >= BREAKER_THRESHOLD {
                tracing::error!(
                    "Store unreachable after {} attempts, backing off for {:?}",
                    breaker.consecutive_failures,
                    BREAKER_WINDOW
                );
                breaker.open_until = Some(Instant::now() + BREAKER_WINDOW);
            }
        } else {
            breaker.consecutive_failures = 0;
            breaker.open_until = None;
        }
    }

    /// 'Get' the json value for the given key, None if the key is missing
    pub async fn get_kv(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check_breaker().await?;
        let mut client = self.client.lock().await;
        let resp = match client.get(key, None).await {
            Ok(resp) => {
                self.record_outcome(false).await;
                resp
            }
            Err(error) => {
                self.record_outcome(true).await;
                return Err(error).context(GetSnafu {
                    key: key.to_string(),
                });
            }
        };
        match resp.kvs().first() {
            Some(kv) => {
                let value_str = kv.value_str().context(ValueStringSnafu {
                    key: key.to_string(),
                })?;
                let value =
                    serde_json::from_str(value_str).context(DeserialiseValueSnafu {
                        value: value_str.to_string(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 'Delete' the entry with the given key; a missing key is a success
    pub async fn delete_kv(&self, key: &str) -> Result<(), StoreError> {
        self.check_breaker().await?;
        let mut client = self.client.lock().await;
        match client.delete(key, None).await {
            Ok(_) => {
                self.record_outcome(false).await;
                Ok(())
            }
            Err(error) => {
                self.record_outcome(true).await;
                Err(error).context(DeleteSnafu {
                    key: key.to_string(),
                })
            }
        }
    }
}
