use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use clap::Parser;
use clap::error::{ContextKind, ContextValue, ErrorKind};
use jiff::civil::Date;
use reqwest::Url;
use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

mod batch;
mod fetch;

pub use batch::{BatchError, RateCollector, sort_results, target_dates};
pub use fetch::{FetchError, fetch, fetch_rate};

const PRIVATBANK_URL: &str = "https://api.privatbank.ua/p24api/exchange_rates";

/// Widest window the archive API is queried for, in days.
pub const MAX_DAYS: u8 = 10;

/// Printed instead of fetching anything when the arguments are missing or invalid.
pub const USAGE_HINT: &str = "Please provide a valid number of days (up to 10) as an argument.";

/// Get USD and EUR cash rates from the PrivatBank archive for each of the last few days.
///
/// Today is never included: `3` means the three calendar days before today.
#[derive(Parser)]
#[command(version)]
pub struct Cli {
    /// Number of days to look back, from 1 to 10
    #[arg(
        value_name = "DAYS",
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(u8).range(1..=i64::from(MAX_DAYS))
    )]
    pub days: u8,

    /// Order the output by date and currency instead of arrival order
    #[arg(long)]
    pub sort: bool,

    /// Give up on a date after this many rate-limited retries
    #[arg(long, value_name = "N", default_value_t = RetryPolicy::default().max_retries)]
    pub max_retries: u32,

    /// Archive endpoint to query
    #[arg(long, value_name = "URL", default_value = PRIVATBANK_URL)]
    pub base_url: Url,
}

impl Cli {
    const FLAGS: [&str; 3] = ["--sort", "--max-retries", "--base-url"];

    /// Whether a parse failure should be answered with [`USAGE_HINT`] rather than clap's
    /// own report. Help, version, and bad values for the named flags keep clap's output.
    pub fn wants_usage_hint(err: &clap::Error) -> bool {
        if matches!(
            err.kind(),
            ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        ) {
            return false;
        }

        let names_flag = |arg: &str| Self::FLAGS.iter().any(|flag| arg.starts_with(flag));
        match err.get(ContextKind::InvalidArg) {
            Some(ContextValue::String(arg)) => !names_flag(arg),
            Some(ContextValue::Strings(args)) => !args.iter().any(|arg| names_flag(arg)),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Usd, Currency::Eur];

    /// ISO 4217 code, as used in the `currency` field of the API.
    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Render a date the way the archive API expects it (`DD.MM.YYYY`).
pub fn date_key(date: Date) -> String {
    date.strftime("%d.%m.%Y").to_string()
}

/// One (date, currency) pair, fetched by exactly one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RateQuery {
    pub date: Date,
    pub currency: Currency,
}

impl RateQuery {
    pub fn new(date: Date, currency: Currency) -> Self {
        Self { date, currency }
    }

    pub fn date_key(&self) -> String {
        date_key(self.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rate {
    pub sale: Decimal,
    pub purchase: Decimal,
}

/// Outcome of one [`RateQuery`]. `rate` is `None` when the fetch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateResult {
    pub date: Date,
    pub currency: Currency,
    pub rate: Option<Rate>,
}

impl RateResult {
    pub fn found(query: RateQuery, rate: Rate) -> Self {
        Self {
            date: query.date,
            currency: query.currency,
            rate: Some(rate),
        }
    }

    pub fn missing(query: RateQuery) -> Self {
        Self {
            date: query.date,
            currency: query.currency,
            rate: None,
        }
    }

    pub fn query(&self) -> RateQuery {
        RateQuery::new(self.date, self.currency)
    }
}

/// `{"DD.MM.YYYY": {"USD": {"sale": .., "purchase": ..}}}` on success,
/// `{"date": "DD.MM.YYYY", "currency": "USD", "rate": null}` on failure.
impl Serialize for RateResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let date = date_key(self.date);
        match &self.rate {
            Some(rate) => {
                let by_currency = BTreeMap::from([(self.currency.code(), rate)]);
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(&date, &by_currency)?;
                map.end()
            }
            None => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("date", &date)?;
                map.serialize_entry("currency", &self.currency)?;
                map.serialize_entry("rate", &None::<Rate>)?;
                map.end()
            }
        }
    }
}

impl fmt::Display for RateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// How a rate-limited (HTTP 429) request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; the request fails once these are used up.
    pub max_retries: u32,
    /// Fixed pause before each retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: Url,
    pub currencies: Vec<Currency>,
    pub retry: RetryPolicy,
    /// Budget for a single HTTP request, connect to body.
    pub request_timeout: Duration,
}

impl Config {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            currencies: Currency::ALL.to_vec(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// `<base_url>?json&date=DD.MM.YYYY`
    pub fn request_url(&self, date: Date) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(Some(&format!("json&date={}", date_key(date))));
        url
    }
}

impl Default for Config {
    fn default() -> Self {
        // The constant is a valid absolute URL
        Self::new(Url::parse(PRIVATBANK_URL).unwrap())
    }
}

impl From<&Cli> for Config {
    fn from(args: &Cli) -> Self {
        let mut config = Config::new(args.base_url.clone());
        config.retry.max_retries = args.max_retries;
        config
    }
}
