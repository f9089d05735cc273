use futures::StreamExt;
use futures::stream::FuturesUnordered;
use jiff::ToSpan;
use jiff::Zoned;
use jiff::civil::Date;
use reqwest::Client;
use thiserror::Error;
use tracing::info;

use crate::fetch::{FetchError, fetch};
use crate::{Config, MAX_DAYS, RateQuery, RateResult};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("cannot get rates for {0} days, expected 1 to {max}", max = MAX_DAYS)]
    InvalidDays(u8),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// The `days` calendar days before `today`, most recent first.
pub fn target_dates(today: Date, days: u8) -> Vec<Date> {
    (1..=i64::from(days)).map(|k| today - k.days()).collect()
}

/// Order results by date, then currency.
pub fn sort_results(results: &mut [RateResult]) {
    results.sort_unstable_by_key(RateResult::query);
}

/// Runs one batch of concurrent rate fetches per call.
pub struct RateCollector {
    config: Config,
}

impl RateCollector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every (date, currency) pair for the window ending yesterday.
    pub fn queries(&self, today: Date, days: u8) -> Vec<RateQuery> {
        self.config
            .currencies
            .iter()
            .flat_map(|&currency| {
                target_dates(today, days)
                    .into_iter()
                    .map(move |date| RateQuery::new(date, currency))
            })
            .collect()
    }

    pub async fn collect(&self, days: u8) -> Result<Vec<RateResult>, BatchError> {
        self.collect_from(Zoned::now().date(), days).await
    }

    /// Fetch all rates for the `days` before `today` at once.
    ///
    /// Results come back in the order the requests finish. Nothing is returned until every
    /// request has either produced a rate or failed.
    pub async fn collect_from(
        &self,
        today: Date,
        days: u8,
    ) -> Result<Vec<RateResult>, BatchError> {
        if days == 0 || days > MAX_DAYS {
            return Err(BatchError::InvalidDays(days));
        }

        let client = Client::builder()
            .timeout(self.config.request_timeout)
            .build()
            .map_err(BatchError::Client)?;

        let mut pending = self
            .queries(today, days)
            .into_iter()
            .map(|query| fetch(&client, &self.config, query))
            .collect::<FuturesUnordered<_>>();

        let mut results = Vec::with_capacity(pending.len());
        let mut fatal = None;
        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(result) => results.push(result),
                Err(err) => {
                    fatal.get_or_insert(err);
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err.into());
        }

        info!(
            requested = results.len(),
            missing = results.iter().filter(|result| result.rate.is_none()).count(),
            "collected rates"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        BatchError, Config, Currency, RateCollector, RateQuery, RateResult, sort_results,
        target_dates,
    };
    use jiff::civil::date;
    use std::collections::HashSet;

    #[test]
    fn test_target_dates() {
        assert_eq!(target_dates(date(2024, 1, 5), 1), vec![date(2024, 1, 4)]);
        // Crosses a month and a year boundary
        assert_eq!(
            target_dates(date(2024, 1, 2), 3),
            vec![date(2024, 1, 1), date(2023, 12, 31), date(2023, 12, 30)]
        );
        // Leap day
        assert_eq!(
            target_dates(date(2024, 3, 1), 2),
            vec![date(2024, 2, 29), date(2024, 2, 28)]
        );
    }

    #[test]
    fn test_queries_cover_every_pair() {
        let collector = RateCollector::new(Config::default());
        let today = date(2024, 1, 11);

        for days in 1..=10 {
            let queries = collector.queries(today, days);
            assert_eq!(queries.len(), usize::from(days) * 2);

            let distinct = queries.iter().collect::<HashSet<_>>();
            assert_eq!(distinct.len(), queries.len());

            let dates = target_dates(today, days);
            for currency in [Currency::Usd, Currency::Eur] {
                for &day in &dates {
                    assert!(distinct.contains(&RateQuery::new(day, currency)));
                }
            }
            assert!(queries.iter().all(|query| query.date < today));
        }
    }

    #[test]
    fn test_reduced_currency_set() {
        let mut config = Config::default();
        config.currencies = vec![Currency::Eur];
        let queries = RateCollector::new(config).queries(date(2024, 1, 11), 4);
        assert_eq!(queries.len(), 4);
        assert!(queries.iter().all(|query| query.currency == Currency::Eur));
    }

    #[tokio::test]
    async fn test_invalid_days_issue_no_requests() {
        // Unroutable endpoint: any request would fail rather than report InvalidDays
        let mut config = Config::default();
        config.base_url = "http://127.0.0.1:9/".parse().unwrap();
        let collector = RateCollector::new(config);

        for days in [0, 11, 200] {
            assert!(matches!(
                collector.collect_from(date(2024, 1, 11), days).await,
                Err(BatchError::InvalidDays(d)) if d == days
            ));
        }
    }

    #[test]
    fn test_sort_results() {
        let mut results = vec![
            RateResult::missing(RateQuery::new(date(2024, 1, 2), Currency::Usd)),
            RateResult::missing(RateQuery::new(date(2024, 1, 1), Currency::Eur)),
            RateResult::missing(RateQuery::new(date(2024, 1, 2), Currency::Eur)),
            RateResult::missing(RateQuery::new(date(2024, 1, 1), Currency::Usd)),
        ];
        sort_results(&mut results);
        assert_eq!(
            results.iter().map(RateResult::query).collect::<Vec<_>>(),
            vec![
                RateQuery::new(date(2024, 1, 1), Currency::Usd),
                RateQuery::new(date(2024, 1, 1), Currency::Eur),
                RateQuery::new(date(2024, 1, 2), Currency::Usd),
                RateQuery::new(date(2024, 1, 2), Currency::Eur),
            ]
        );
    }
}
