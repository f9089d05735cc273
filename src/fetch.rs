use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{Config, Currency, Rate, RateQuery, RateResult};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("malformed response body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("no {0} entry in response")]
    CurrencyNotFound(Currency),
    #[error("{currency} entry has no {field}")]
    MissingRate {
        currency: Currency,
        field: &'static str,
    },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err)
        } else {
            FetchError::Transport(err)
        }
    }
}

impl FetchError {
    /// Contained errors only cost their own query a rate. The rest mean the request itself
    /// could not be built, so every other query would fail the same way.
    pub fn is_contained(&self) -> bool {
        !matches!(self, FetchError::Transport(err) if err.is_builder())
    }
}

/// Fetch one rate, retrying while the API answers 429.
pub async fn fetch_rate(
    client: &Client,
    config: &Config,
    query: &RateQuery,
) -> Result<Rate, FetchError> {
    let url = config.request_url(query.date);
    let mut attempts = 0;

    loop {
        attempts += 1;
        debug!(%url, currency = %query.currency, attempts, "requesting rates");
        let resp = client.get(url.clone()).send().await?;

        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                if attempts > config.retry.max_retries {
                    return Err(FetchError::RateLimited { attempts });
                }
                debug!(date = %query.date_key(), currency = %query.currency, "rate limited, backing off");
                tokio::time::sleep(config.retry.backoff).await;
            }
            status if status.is_success() => {
                let body = resp.bytes().await?;
                let rates = serde_json::from_slice::<ExchangeRatesResponse>(&body)?;
                return select_rate(rates, query.currency);
            }
            status => return Err(FetchError::Status(status)),
        }
    }
}

/// Fetch one rate, folding contained failures into a rate-less result.
pub async fn fetch(
    client: &Client,
    config: &Config,
    query: RateQuery,
) -> Result<RateResult, FetchError> {
    match fetch_rate(client, config, &query).await {
        Ok(rate) => Ok(RateResult::found(query, rate)),
        Err(err) if err.is_contained() => {
            warn!(
                "Error getting rate for {} on {}: {err}",
                query.currency,
                query.date_key()
            );
            Ok(RateResult::missing(query))
        }
        Err(err) => Err(err),
    }
}

fn select_rate(rates: ExchangeRatesResponse, currency: Currency) -> Result<Rate, FetchError> {
    let entry = rates
        .exchange_rate
        .into_iter()
        .find(|entry| entry.currency.as_deref() == Some(currency.code()))
        .ok_or(FetchError::CurrencyNotFound(currency))?;

    Ok(Rate {
        sale: entry.sale_rate.ok_or(FetchError::MissingRate {
            currency,
            field: "saleRate",
        })?,
        purchase: entry.purchase_rate.ok_or(FetchError::MissingRate {
            currency,
            field: "purchaseRate",
        })?,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRatesResponse {
    exchange_rate: Vec<ExchangeRate>,
}

/// Entries for minor currencies only carry the National Bank rates, so the cash rates
/// are optional.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRate {
    currency: Option<String>,
    sale_rate: Option<Decimal>,
    purchase_rate: Option<Decimal>,
}
