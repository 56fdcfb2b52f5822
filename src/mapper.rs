use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FreebeanError, Result};
use crate::models::WalletType;

/// Mapping written by `freebean init`. Account names are grouped by the ledger's top-level
/// category; tax accounts are keyed by freee tax code.
pub const DEFAULT_MAPPING: &str = r#"{
  "accounts": {
    "assets": {
      "現金": "Assets:Cash",
      "普通預金": "Assets:Bank:Ordinary",
      "売掛金": "Assets:Receivable",
      "前払費用": "Assets:Prepaid"
    },
    "liabilities": {
      "買掛金": "Liabilities:Payable",
      "未払金": "Liabilities:Accrued",
      "預り金": "Liabilities:Withholding"
    },
    "equity": {
      "元入金": "Equity:Capital",
      "事業主貸": "Equity:OwnerDrawings",
      "事業主借": "Equity:OwnerContributions"
    },
    "income": {
      "売上高": "Income:Sales",
      "雑収入": "Income:Misc",
      "受取利息": "Income:Interest"
    },
    "expenses": {
      "仕入高": "Expenses:Purchases",
      "消耗品費": "Expenses:Supplies",
      "通信費": "Expenses:Communication",
      "旅費交通費": "Expenses:Travel",
      "地代家賃": "Expenses:Rent",
      "水道光熱費": "Expenses:Utilities",
      "支払手数料": "Expenses:Fees",
      "会議費": "Expenses:Meetings",
      "接待交際費": "Expenses:Entertainment",
      "広告宣伝費": "Expenses:Advertising",
      "新聞図書費": "Expenses:Books",
      "給料手当": "Expenses:Salaries",
      "租税公課": "Expenses:Taxes"
    }
  },
  "tax": {
    "21": "Liabilities:ConsumptionTax:Standard",
    "136": "Liabilities:ConsumptionTax:Standard",
    "129": "Liabilities:ConsumptionTax:Reduced",
    "163": "Liabilities:ConsumptionTax:Reduced"
  },
  "standard_tax_account": "Liabilities:ConsumptionTax:Standard",
  "wallets": {
    "bank_account": "Assets:Bank:Ordinary",
    "credit_card": "Liabilities:CreditCard"
  },
  "default_bank_account": "Assets:Bank:Ordinary",
  "unmapped_prefix": "Expenses:Unmapped"
}
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryMap {
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
    #[serde(default)]
    pub liabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub equity: BTreeMap<String, String>,
    #[serde(default)]
    pub income: BTreeMap<String, String>,
    #[serde(default)]
    pub expenses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletMap {
    pub bank_account: Option<String>,
    pub credit_card: Option<String>,
}

/// On-disk layout of the mapping file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub accounts: CategoryMap,
    #[serde(default)]
    pub tax: BTreeMap<String, String>,
    #[serde(default = "default_standard_tax_account")]
    pub standard_tax_account: String,
    #[serde(default)]
    pub wallets: WalletMap,
    #[serde(default = "default_bank_account")]
    pub default_bank_account: String,
    #[serde(default = "default_unmapped_prefix")]
    pub unmapped_prefix: String,
}

fn default_standard_tax_account() -> String {
    "Liabilities:ConsumptionTax:Standard".to_string()
}

fn default_bank_account() -> String {
    "Assets:Bank:Ordinary".to_string()
}

fn default_unmapped_prefix() -> String {
    "Expenses:Unmapped".to_string()
}

/// Resolves freee account item names and tax codes to ledger accounts.
#[derive(Debug, Clone)]
pub struct AccountMapper {
    accounts: HashMap<String, String>,
    tax: HashMap<i64, String>,
    standard_tax_account: String,
    bank_account: String,
    credit_card_account: String,
    default_bank_account: String,
    unmapped_prefix: String,
    invalid_chars: Regex,
}

impl AccountMapper {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mapping: MappingFile = serde_json::from_str(&content).map_err(|e| {
            FreebeanError::Config(format!("invalid mapping file {}: {e}", path.display()))
        })?;
        Self::from_mapping(mapping)
    }

    pub fn from_mapping(mapping: MappingFile) -> Result<Self> {
        let mut accounts = HashMap::new();
        let categories = [
            &mapping.accounts.assets,
            &mapping.accounts.liabilities,
            &mapping.accounts.equity,
            &mapping.accounts.income,
            &mapping.accounts.expenses,
        ];
        for category in categories {
            for (name, account) in category {
                accounts.insert(name.clone(), account.clone());
            }
        }

        let mut tax = HashMap::new();
        for (code, account) in &mapping.tax {
            let code: i64 = code
                .trim()
                .parse()
                .map_err(|_| FreebeanError::Config(format!("tax code is not a number: {code}")))?;
            tax.insert(code, account.clone());
        }

        let bank_account = mapping
            .wallets
            .bank_account
            .unwrap_or_else(|| mapping.default_bank_account.clone());
        let credit_card_account = mapping
            .wallets
            .credit_card
            .unwrap_or_else(|| "Liabilities:CreditCard".to_string());

        Ok(Self {
            accounts,
            tax,
            standard_tax_account: mapping.standard_tax_account,
            bank_account,
            credit_card_account,
            default_bank_account: mapping.default_bank_account,
            unmapped_prefix: mapping.unmapped_prefix,
            invalid_chars: Regex::new(r"[\s:]+").map_err(|e| FreebeanError::Other(e.to_string()))?,
        })
    }

    pub fn builtin() -> Result<Self> {
        let mapping: MappingFile = serde_json::from_str(DEFAULT_MAPPING)?;
        Self::from_mapping(mapping)
    }

    pub fn resolve(&self, account_item_name: &str) -> Option<&str> {
        self.accounts.get(account_item_name).map(String::as_str)
    }

    pub fn resolve_tax(&self, tax_code: i64) -> Option<&str> {
        self.tax.get(&tax_code).map(String::as_str)
    }

    pub fn standard_tax_account(&self) -> &str {
        &self.standard_tax_account
    }

    /// Placeholder account for a name missing from the mapping. Whitespace and colons are
    /// stripped so the result is a single account component.
    pub fn fallback_account(&self, account_item_name: &str) -> String {
        let component = self.invalid_chars.replace_all(account_item_name, "");
        let component = if component.is_empty() { "Unknown".into() } else { component };
        format!("{}:{}", self.unmapped_prefix, component)
    }

    pub fn wallet_account(&self, wallet_type: WalletType) -> &str {
        match wallet_type {
            WalletType::BankAccount => &self.bank_account,
            WalletType::CreditCard => &self.credit_card_account,
            _ => &self.default_bank_account,
        }
    }

    pub fn default_bank_account(&self) -> &str {
        &self.default_bank_account
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_mapping_resolves_categories() {
        let mapper = AccountMapper::builtin().unwrap();
        assert_eq!(mapper.resolve("売上高"), Some("Income:Sales"));
        assert_eq!(mapper.resolve("消耗品費"), Some("Expenses:Supplies"));
        assert_eq!(mapper.resolve("普通預金"), Some("Assets:Bank:Ordinary"));
        assert_eq!(mapper.resolve("元入金"), Some("Equity:Capital"));
        assert!(mapper.len() >= 20);
    }

    #[test]
    fn test_unmapped_name_falls_back() {
        let mapper = AccountMapper::builtin().unwrap();
        assert_eq!(mapper.resolve("未知の科目"), None);
        assert_eq!(mapper.fallback_account("未知の科目"), "Expenses:Unmapped:未知の科目");
    }

    #[test]
    fn test_fallback_strips_whitespace() {
        let mapper = AccountMapper::builtin().unwrap();
        assert_eq!(mapper.fallback_account("未知の 科目\u{3000}A"), "Expenses:Unmapped:未知の科目A");
        assert_eq!(mapper.fallback_account("  "), "Expenses:Unmapped:Unknown");
        assert_eq!(mapper.fallback_account("a:b"), "Expenses:Unmapped:ab");
    }

    #[test]
    fn test_tax_resolution_by_code() {
        let mapper = AccountMapper::builtin().unwrap();
        assert_eq!(mapper.resolve_tax(136), Some("Liabilities:ConsumptionTax:Standard"));
        assert_eq!(mapper.resolve_tax(163), Some("Liabilities:ConsumptionTax:Reduced"));
        assert_eq!(mapper.resolve_tax(0), None);
    }

    #[test]
    fn test_wallet_accounts() {
        let mapper = AccountMapper::builtin().unwrap();
        assert_eq!(mapper.wallet_account(WalletType::BankAccount), "Assets:Bank:Ordinary");
        assert_eq!(mapper.wallet_account(WalletType::CreditCard), "Liabilities:CreditCard");
        assert_eq!(mapper.wallet_account(WalletType::Other), "Assets:Bank:Ordinary");
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, r#"{"accounts": {"expenses": {"雑費": "Expenses:Misc"}}}"#).unwrap();
        let mapper = AccountMapper::load(&path).unwrap();
        assert_eq!(mapper.resolve("雑費"), Some("Expenses:Misc"));
        assert_eq!(mapper.default_bank_account(), "Assets:Bank:Ordinary");
        assert_eq!(mapper.standard_tax_account(), "Liabilities:ConsumptionTax:Standard");
        assert_eq!(mapper.wallet_account(WalletType::BankAccount), "Assets:Bank:Ordinary");
    }

    #[test]
    fn test_load_rejects_bad_tax_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, r#"{"tax": {"ten": "Liabilities:Tax"}}"#).unwrap();
        assert!(matches!(AccountMapper::load(&path), Err(FreebeanError::Config(_))));
    }
}
