use chrono::{Datelike, Months, NaiveDate};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Calendar snapping applied to staged dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateAlignment {
    #[default]
    AsIs,
    MonthStart,
    MonthEnd,
}

impl DateAlignment {
    pub fn align(&self, date: NaiveDate) -> NaiveDate {
        match self {
            DateAlignment::AsIs => date,
            DateAlignment::MonthStart => month_start(date),
            DateAlignment::MonthEnd => month_end(date),
        }
    }
}

/// How observations falling into one month collapse into a single monthly observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Keep every observation.
    #[default]
    AsIs,
    /// Mean of the present values; all-missing months stay missing.
    Mean,
    /// Last present value by date.
    Last,
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn month_end(date: NaiveDate) -> NaiveDate {
    month_start(date)
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

/// Groups observations by calendar month; each month is reported on the date the `alignment` picks
/// (month end when left `AsIs`, as the monthly series are published).
pub fn aggregate_monthly(rows: &[(NaiveDate, Option<f64>)], aggregation: Aggregation, alignment: DateAlignment) -> Vec<(NaiveDate, Option<f64>)> {
    if aggregation == Aggregation::AsIs {
        return rows.iter().map(|(d, v)| (alignment.align(*d), *v)).collect();
    }
    let anchor = match alignment {
        DateAlignment::MonthStart => DateAlignment::MonthStart,
        _ => DateAlignment::MonthEnd,
    };
    let mut months: BTreeMap<NaiveDate, Vec<(NaiveDate, f64)>> = BTreeMap::new();
    for (date, value) in rows {
        let bucket = months.entry(anchor.align(*date)).or_default();
        if let Some(v) = value {
            bucket.push((*date, *v));
        }
    }
    months
        .into_iter()
        .map(|(month, mut values)| {
            let value = match aggregation {
                _ if values.is_empty() => None,
                Aggregation::Mean => Some(values.iter().map(|(_, v)| v).sum::<f64>() / values.len() as f64),
                _ => {
                    values.sort_by_key(|(d, _)| *d);
                    values.last().map(|(_, v)| *v)
                }
            };
            (month, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_end_handles_leap_years_and_december() {
        assert_eq!(month_end(d(2024, 2, 10)), d(2024, 2, 29));
        assert_eq!(month_end(d(2023, 2, 10)), d(2023, 2, 28));
        assert_eq!(month_end(d(2024, 12, 1)), d(2024, 12, 31));
        assert_eq!(month_start(d(2024, 12, 31)), d(2024, 12, 1));
    }

    #[test]
    fn weekly_rates_average_into_month_end() {
        let weekly = vec![
            (d(2024, 1, 4), Some(6.62)),
            (d(2024, 1, 11), Some(6.66)),
            (d(2024, 1, 18), None),
            (d(2024, 1, 25), Some(6.69)),
            (d(2024, 2, 1), Some(6.63)),
        ];
        let monthly = aggregate_monthly(&weekly, Aggregation::Mean, DateAlignment::AsIs);
        assert_eq!(monthly.len(), 2);
        assert_eq!(monthly[0].0, d(2024, 1, 31));
        assert!((monthly[0].1.unwrap() - (6.62 + 6.66 + 6.69) / 3.0).abs() < 1e-12);
        assert_eq!(monthly[1], (d(2024, 2, 29), Some(6.63)));
    }

    #[test]
    fn last_picks_latest_present_value() {
        let daily = vec![(d(2024, 3, 28), Some(5.0)), (d(2024, 3, 29), None), (d(2024, 3, 1), Some(4.0))];
        let monthly = aggregate_monthly(&daily, Aggregation::Last, DateAlignment::MonthStart);
        assert_eq!(monthly, vec![(d(2024, 3, 1), Some(5.0))]);
    }

    #[test]
    fn all_missing_month_stays_missing() {
        let rows = vec![(d(2024, 5, 3), None), (d(2024, 5, 10), None)];
        assert_eq!(aggregate_monthly(&rows, Aggregation::Mean, DateAlignment::MonthEnd), vec![(d(2024, 5, 31), None)]);
    }

    #[test]
    fn as_is_only_aligns() {
        let rows = vec![(d(2024, 5, 3), Some(1.0)), (d(2024, 6, 3), None)];
        assert_eq!(
            aggregate_monthly(&rows, Aggregation::AsIs, DateAlignment::MonthEnd),
            vec![(d(2024, 5, 31), Some(1.0)), (d(2024, 6, 30), None)]
        );
    }
}
