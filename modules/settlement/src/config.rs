use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Description keys of order-less fee rows that get their own posting line
pub const DEFAULT_SPECIAL_FEES: &[&str] = &[
    "STORAGE FEE",
    "STORAGERENEWALBILLING",
    "FBA INBOUND PLACEMENT SERVICE FEE",
    "INBOUND TRANSPORTATION FEE",
    "REMOVALCOMPLETE",
    "COMPENSATED_CLAWBACK",
    "DISPOSALCOMPLETE",
    "LIQUIDATIONSBROKERAGEFEE",
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),

    #[error("{name} is invalid: {value}")]
    Invalid { name: String, value: String },

    #[error("No clearing/debtors/customer mapping for settlement currency {0}")]
    MissingCurrencyAccounts(String),

    #[error("Settlement sync is disabled")]
    SyncDisabled,
}

/// Ledger accounts and party used for one settlement currency
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyAccounts {
    pub clearing: String,
    pub debtors: String,
    pub customer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountMap {
    pub currencies: HashMap<String, CurrencyAccounts>,
    pub reimbursement: String,
    pub misc_fees: String,
    pub round_off: String,
    pub bank: String,
    /// Upper-cased description -> account
    pub special_fees: BTreeMap<String, String>,
    /// Prefix for credit-note charge accounts, e.g. "Amazon Shipping"
    pub charge_account_prefix: String,
}

impl AccountMap {
    pub fn for_currency(&self, currency: &str) -> Result<&CurrencyAccounts, ConfigError> {
        self.currencies
            .get(&currency.to_uppercase())
            .ok_or_else(|| ConfigError::MissingCurrencyAccounts(currency.to_uppercase()))
    }

    pub fn is_clearing_account(&self, account: &str) -> bool {
        self.currencies.values().any(|c| c.clearing == account)
    }

    pub fn charge_account(&self, description: &str) -> String {
        format!("{} {}", self.charge_account_prefix, title_case(description))
    }

    /// Special-fee map with every default description routed to its charge account
    pub fn default_special_fees(prefix: &str) -> BTreeMap<String, String> {
        DEFAULT_SPECIAL_FEES
            .iter()
            .map(|d| (d.to_string(), format!("{} {}", prefix, title_case(d))))
            .collect()
    }
}

/// Knobs consumed by the posting, allocation and scheduling services
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementSettings {
    pub base_currency: String,
    pub currency_precision: u32,
    pub accounts: AccountMap,
    pub reports_per_run: usize,
    pub days_back: i64,
    pub after_date: Option<NaiveDate>,
    pub report_spacing: Duration,
    pub misc_fee_alert_threshold: Decimal,
    pub large_imbalance_threshold: Decimal,
    pub long_lane_line_threshold: usize,
    pub clearing_lookback_days: i64,
}

impl SettlementSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.currencies.is_empty() {
            return Err(ConfigError::Missing("SETTLEMENT_CURRENCIES".to_string()));
        }
        for (name, value) in [
            ("SETTLEMENT_REIMBURSEMENT_ACCOUNT", &self.accounts.reimbursement),
            ("SETTLEMENT_MISC_FEES_ACCOUNT", &self.accounts.misc_fees),
            ("SETTLEMENT_ROUND_OFF_ACCOUNT", &self.accounts.round_off),
            ("SETTLEMENT_BANK_ACCOUNT", &self.accounts.bank),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name.to_string()));
            }
        }
        for (ccy, accounts) in &self.accounts.currencies {
            if accounts.clearing.is_empty() || accounts.debtors.is_empty() || accounts.customer.is_empty() {
                return Err(ConfigError::MissingCurrencyAccounts(ccy.clone()));
            }
        }
        Ok(())
    }

    /// Smallest base-currency imbalance the finalize job corrects
    pub fn finalize_threshold(&self) -> Decimal {
        Decimal::new(5, self.currency_precision + 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceConfig {
    pub endpoint: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub page_delay: Duration,
    pub max_attempts: u32,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub ledger_backend: String,
    pub database_url: Option<String>,
    pub marketplace: MarketplaceConfig,
    pub fx_provider_url: String,
    pub daily_interval: Duration,
    pub hourly_interval: Duration,
    pub settlement: SettlementSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let ledger_backend = env::var("LEDGER_BACKEND")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase();

        let database_url = env::var("DATABASE_URL").ok();
        if ledger_backend == "postgres" && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL".to_string()));
        }

        let marketplace = MarketplaceConfig {
            endpoint: env::var("MARKETPLACE_ENDPOINT")
                .unwrap_or_else(|_| "https://sellingpartnerapi-na.amazon.com".to_string()),
            auth_url: env::var("MARKETPLACE_AUTH_URL")
                .unwrap_or_else(|_| "https://api.amazon.com/auth/o2/token".to_string()),
            client_id: required("MARKETPLACE_CLIENT_ID")?,
            client_secret: required("MARKETPLACE_CLIENT_SECRET")?,
            refresh_token: required("MARKETPLACE_REFRESH_TOKEN")?,
            page_delay: Duration::from_millis(parse_or("MARKETPLACE_PAGE_DELAY_MS", 2000u64)?),
            max_attempts: parse_or("MARKETPLACE_MAX_ATTEMPTS", 5u32)?,
        };

        let fx_provider_url = env::var("FX_PROVIDER_URL")
            .unwrap_or_else(|_| "https://api.frankfurter.app".to_string());

        let daily_interval = Duration::from_secs(parse_or("SETTLEMENT_DAILY_INTERVAL_SECS", 86_400u64)?);
        let hourly_interval = Duration::from_secs(parse_or("SETTLEMENT_HOURLY_INTERVAL_SECS", 3_600u64)?);

        let settlement = settlement_from_env()?;
        settlement.validate()?;

        Ok(Config {
            ledger_backend,
            database_url,
            marketplace,
            fx_provider_url,
            daily_interval,
            hourly_interval,
            settlement,
        })
    }
}

fn settlement_from_env() -> Result<SettlementSettings, ConfigError> {
    let base_currency = env::var("SETTLEMENT_BASE_CURRENCY")
        .unwrap_or_else(|_| "USD".to_string())
        .to_uppercase();

    let currency_list = env::var("SETTLEMENT_CURRENCIES").unwrap_or_else(|_| base_currency.clone());
    let mut currencies = HashMap::new();
    for ccy in currency_list.split(',').map(|c| c.trim().to_uppercase()).filter(|c| !c.is_empty()) {
        let lookup = |suffix: &str| {
            env::var(format!("SETTLEMENT_{}_{}", ccy, suffix))
                .map_err(|_| ConfigError::MissingCurrencyAccounts(ccy.clone()))
        };
        let accounts = CurrencyAccounts {
            clearing: lookup("CLEARING_ACCOUNT")?,
            debtors: lookup("DEBTORS_ACCOUNT")?,
            customer: lookup("CUSTOMER")?,
        };
        currencies.insert(ccy, accounts);
    }

    let charge_account_prefix = env::var("SETTLEMENT_CHARGE_ACCOUNT_PREFIX")
        .unwrap_or_else(|_| "Amazon".to_string());

    let special_fees = match env::var("SETTLEMENT_SPECIAL_FEE_ACCOUNTS") {
        Ok(raw) => parse_special_fee_map(&raw)?,
        Err(_) => AccountMap::default_special_fees(&charge_account_prefix),
    };

    let accounts = AccountMap {
        currencies,
        reimbursement: required("SETTLEMENT_REIMBURSEMENT_ACCOUNT")?,
        misc_fees: required("SETTLEMENT_MISC_FEES_ACCOUNT")?,
        round_off: required("SETTLEMENT_ROUND_OFF_ACCOUNT")?,
        bank: required("SETTLEMENT_BANK_ACCOUNT")?,
        special_fees,
        charge_account_prefix,
    };

    let after_date = match env::var("SETTLEMENT_AFTER_DATE") {
        Ok(raw) if !raw.trim().is_empty() => Some(
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| ConfigError::Invalid {
                name: "SETTLEMENT_AFTER_DATE".to_string(),
                value: raw.clone(),
            })?,
        ),
        _ => None,
    };

    Ok(SettlementSettings {
        base_currency,
        currency_precision: parse_or("SETTLEMENT_CURRENCY_PRECISION", 2u32)?,
        accounts,
        reports_per_run: parse_or("SETTLEMENT_REPORTS_PER_RUN", 4usize)?,
        days_back: parse_or("SETTLEMENT_DAYS_BACK", 90i64)?,
        after_date,
        report_spacing: Duration::from_secs(parse_or("SETTLEMENT_REPORT_SPACING_SECS", 10u64)?),
        misc_fee_alert_threshold: parse_or("SETTLEMENT_MISC_FEE_ALERT", Decimal::new(5000, 2))?,
        large_imbalance_threshold: Decimal::ONE,
        long_lane_line_threshold: 200,
        clearing_lookback_days: 90,
    })
}

/// Parse `DESC=Account;DESC=Account`; descriptions are upper-cased
pub fn parse_special_fee_map(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut map = BTreeMap::new();
    for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (desc, account) = pair.split_once('=').ok_or_else(|| ConfigError::Invalid {
            name: "SETTLEMENT_SPECIAL_FEE_ACCOUNTS".to_string(),
            value: pair.to_string(),
        })?;
        map.insert(desc.trim().to_uppercase(), account.trim().to_string());
    }
    Ok(map)
}

/// "STORAGE FEE" -> "Storage Fee"
pub fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::Missing(name.to_string()))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}
