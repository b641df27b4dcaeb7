//! Standard business fields and their synonyms.

use crate::model::ColumnType;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct StandardField {
    pub name: &'static str,
    pub label: &'static str,
    pub synonyms: &'static [&'static str],
    pub category: &'static str,
    pub data_type_hint: ColumnType,
    pub required: bool,
}

macro_rules! field {
    ($name:expr, $label:expr, $category:expr, $hint:ident, $required:expr, [$($syn:expr),* $(,)?]) => {
        StandardField {
            name: $name,
            label: $label,
            synonyms: &[$($syn),*],
            category: $category,
            data_type_hint: ColumnType::$hint,
            required: $required,
        }
    };
}

static FIELDS: &[StandardField] = &[
    field!("period", "期间", "time", Date, true, ["期间", "月份", "日期", "年月", "会计期间", "period", "month", "date"]),
    field!("year", "年度", "time", Text, false, ["年度", "年份", "year", "fiscal_year"]),
    field!("factory", "工厂", "organization", Text, false, ["工厂", "厂区", "基地", "factory", "plant", "site"]),
    field!("department", "部门", "organization", Text, false, ["部门", "车间", "科室", "department", "dept", "workshop"]),
    field!("item", "项目", "dimension", Text, false, ["项目", "科目", "指标", "名称", "item", "account", "metric", "indicator"]),
    field!("product", "产品", "dimension", Text, false, ["产品", "品名", "产品名称", "product", "sku"]),
    field!("revenue", "营业收入", "income", Currency, true, ["营业收入", "收入", "销售收入", "销售额", "营收", "revenue", "sales", "income", "turnover"]),
    field!("cost", "营业成本", "cost", Currency, true, ["营业成本", "成本", "销售成本", "cost", "cogs", "cost_of_sales"]),
    field!("expense", "费用", "cost", Currency, false, ["费用", "期间费用", "管理费用", "销售费用", "expense", "expenses", "opex"]),
    field!("gross_profit", "毛利", "profit", Currency, false, ["毛利", "毛利润", "gross_profit", "gross_margin_amount"]),
    field!("gross_margin", "毛利率", "profit", Percentage, false, ["毛利率", "gross_margin", "margin_rate"]),
    field!("profit", "利润", "profit", Currency, true, ["利润", "利润总额", "净利润", "profit", "net_profit", "net_income"]),
    field!("budget_amount", "预算金额", "plan", Currency, false, ["预算金额", "预算", "预算数", "计划", "计划数", "budget", "budget_amount", "plan"]),
    field!("actual_amount", "实际金额", "actual", Currency, false, ["实际金额", "实际", "实际数", "实绩", "actual", "actual_amount"]),
    field!("variance", "差异", "analysis", Currency, false, ["差异", "差额", "偏差", "variance", "difference", "diff"]),
    field!("completion_rate", "完成率", "analysis", Percentage, false, ["完成率", "达成率", "执行率", "completion_rate", "achievement_rate"]),
    field!("growth_rate", "增长率", "analysis", Percentage, false, ["增长率", "同比", "环比", "增幅", "growth_rate", "yoy", "mom"]),
    field!("quantity", "数量", "volume", Numeric, false, ["数量", "产量", "销量", "件数", "quantity", "qty", "volume", "output"]),
    field!("unit_price", "单价", "price", Currency, false, ["单价", "价格", "unit_price", "price"]),
    field!("amount", "金额", "amount", Currency, false, ["金额", "总额", "合计", "amount", "total"]),
    field!("headcount", "人数", "workforce", Numeric, false, ["人数", "员工数", "在岗人数", "headcount", "employees"]),
    field!("remark", "备注", "meta", Text, false, ["备注", "说明", "remark", "note", "comment"]),
];

static BY_NAME: Lazy<HashMap<&'static str, &'static StandardField>> =
    Lazy::new(|| FIELDS.iter().map(|f| (f.name, f)).collect());

pub fn standard_fields() -> &'static [StandardField] {
    FIELDS
}

pub fn lookup(name: &str) -> Option<&'static StandardField> {
    BY_NAME.get(name).copied()
}

/// Split a time-suffixed field such as `budget_amount_202501` into its base
/// field and `YYYYMM` suffix.
pub fn split_period_suffix(name: &str) -> Option<(&'static StandardField, &str)> {
    let (base, suffix) = name.rsplit_once('_')?;
    let valid_suffix = suffix.len() == 6
        && suffix.chars().all(|c| c.is_ascii_digit())
        && matches!(suffix[4..].parse::<u32>(), Ok(1..=12));
    if !valid_suffix {
        return None;
    }
    Some((lookup(base)?, suffix))
}

/// A standard field, or a standard field with a valid `_YYYYMM` suffix.
pub fn resolve(name: &str) -> Option<&'static StandardField> {
    lookup(name).or_else(|| split_period_suffix(name).map(|(field, _)| field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        assert_eq!(BY_NAME.len(), FIELDS.len());
    }

    #[test]
    fn test_resolve_time_suffixed_names() {
        assert_eq!(resolve("revenue").unwrap().category, "income");
        assert_eq!(resolve("budget_amount_202501").unwrap().name, "budget_amount");
        assert!(resolve("budget_amount_202513").is_none());
        assert!(resolve("budget_amount_2025").is_none());
        assert!(resolve("bonus_202501").is_none());
        assert!(resolve("made_up_field").is_none());
    }
}
