use crate::StoreError;
use chrono::{Datelike, NaiveDate};

/// Implements `redb::Value` for a row type encoded with bincode.
/// Example: pub struct FactRow { ... } (must impl bincode::Encode + Decode)
#[macro_export]
macro_rules! impl_redb_value_bincode {
    ($Row:ident) => {
        impl redb::Value for $Row {
            type SelfType<'a> = $Row where Self: 'a;
            // Bincode encoding allocates; expose owned bytes.
            type AsBytes<'a> = Vec<u8> where Self: 'a;

            fn fixed_width() -> Option<usize> { None }

            fn from_bytes<'a>(data: &'a [u8]) -> $Row
            where Self: 'a {
                bincode::decode_from_slice::<$Row, _>(data, bincode::config::standard())
                    .expect(concat!("corrupt ", stringify!($Row), " row"))
                    .0
            }

            fn as_bytes<'a, 'b: 'a>(value: &'a Self::SelfType<'b>) -> Vec<u8>
            where Self: 'a, Self: 'b {
                bincode::encode_to_vec(value, bincode::config::standard())
                    .expect(concat!("unencodable ", stringify!($Row), " row"))
            }

            fn type_name() -> redb::TypeName {
                redb::TypeName::new(concat!("factstore::", stringify!($Row)))
            }
        }
    };
}

/// Facts are keyed by days from the common era so that the natural `i32` ordering is calendar ordering.
#[inline]
pub fn day_of(date: NaiveDate) -> i32 {
    date.num_days_from_ce()
}

pub fn date_of(day: i32) -> Result<NaiveDate, StoreError> {
    NaiveDate::from_num_days_from_ce_opt(day).ok_or_else(|| StoreError::Corrupt(format!("day number {day} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_numbers_preserve_calendar_order() {
        let jan = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let feb = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        assert_eq!(day_of(feb) - day_of(jan), 1);
        assert_eq!(date_of(day_of(feb)).unwrap(), feb);
    }

    #[test]
    fn extreme_dates_fit_the_key() {
        assert_eq!(date_of(day_of(NaiveDate::MIN)).unwrap(), NaiveDate::MIN);
        assert_eq!(date_of(day_of(NaiveDate::MAX)).unwrap(), NaiveDate::MAX);
        assert!(date_of(i32::MAX).is_err());
    }
}
