// 大写金额 - spell a currency amount in Chinese financial numerals

use crate::error::ValidationError;
use crate::settlement::round_currency;

const DIGITS: [&str; 10] = ["零", "壹", "贰", "叁", "肆", "伍", "陆", "柒", "捌", "玖"];
const PLACE_UNITS: [&str; 4] = ["仟", "佰", "拾", ""];
const GROUP_UNITS: [&str; 4] = ["", "万", "亿", "兆"];

/// Largest integer part that still has a group unit (below 10^16)
const MAX_INTEGER: u64 = 9_999_999_999_999_999;

/// Spell `amount` (rounded to cents) as e.g. `壹仟零伍元伍角`.
///
/// Zero runs inside the integer part collapse to a single 零 and trailing
/// zeros are dropped. Each of 角/分 only appears when its digit is non-zero;
/// zero cents give 整.
pub fn amount_to_words(amount: f64) -> Result<String, ValidationError> {
    if !amount.is_finite() {
        return Err(ValidationError::new("amount", "must be a finite number"));
    }

    let cents_total = (round_currency(amount.abs()) * 100.0).round();
    if cents_total / 100.0 > MAX_INTEGER as f64 {
        return Err(ValidationError::new("amount", "too large to spell out"));
    }
    let cents_total = cents_total as u64;
    let integer = cents_total / 100;
    let jiao = ((cents_total / 10) % 10) as usize;
    let fen = (cents_total % 10) as usize;

    let mut out = String::new();
    if amount < 0.0 && cents_total > 0 {
        out.push('负');
    }

    out.push_str(&spell_integer(integer));
    out.push('元');

    if jiao == 0 && fen == 0 {
        out.push('整');
    } else {
        if jiao != 0 {
            out.push_str(DIGITS[jiao]);
            out.push('角');
        }
        if fen != 0 {
            out.push_str(DIGITS[fen]);
            out.push('分');
        }
    }

    Ok(out)
}

fn spell_integer(value: u64) -> String {
    if value == 0 {
        return DIGITS[0].to_string();
    }

    // Four-digit groups, most significant first
    let mut groups = Vec::new();
    let mut rest = value;
    while rest > 0 {
        groups.push((rest % 10_000) as u16);
        rest /= 10_000;
    }

    let mut out = String::new();
    let mut pending_zero = false;

    for (position, group) in groups.iter().enumerate().rev() {
        if *group == 0 {
            if !out.is_empty() {
                pending_zero = true;
            }
            continue;
        }
        // A skipped group, or leading zeros inside this group, read as one 零
        if !out.is_empty() && (pending_zero || *group < 1000) {
            out.push_str(DIGITS[0]);
        }
        out.push_str(&spell_group(*group));
        out.push_str(GROUP_UNITS[position]);
        pending_zero = false;
    }

    out
}

/// Spell 1..=9999 without leading or trailing 零
fn spell_group(group: u16) -> String {
    let digits = [group / 1000, (group / 100) % 10, (group / 10) % 10, group % 10];

    let mut out = String::new();
    let mut started = false;
    let mut zero_run = false;

    for (digit, unit) in digits.iter().zip(PLACE_UNITS.iter()) {
        if *digit == 0 {
            zero_run = started;
            continue;
        }
        if zero_run {
            out.push_str(DIGITS[0]);
            zero_run = false;
        }
        out.push_str(DIGITS[*digit as usize]);
        out.push_str(unit);
        started = true;
    }

    out
}
