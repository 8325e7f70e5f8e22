//! Narrow pod comparison.
//!
//! A live pod carries fields injected by admission controllers and the
//! scheduler, so structural equality with a generated pod never holds. Only the
//! primary container's entrypoint command and its CPU/memory limits decide
//! whether a pod has drifted.

use k8s_openapi::{
    api::core::v1::{Container, Pod},
    apimachinery::pkg::api::resource::Quantity,
};
use tracing::debug;

/// Returns `true` when `observed` runs the same command with the same CPU and
/// memory limits as `desired`. Every other field is ignored.
pub fn pod_matches(desired: &Pod, observed: &Pod) -> bool {
    let (Some(desired), Some(observed)) = (primary_container(desired), primary_container(observed))
    else {
        debug!("Pod has no containers");
        return false;
    };

    if desired.command != observed.command {
        debug!("Container commands not equal");
        return false;
    }

    for resource in ["cpu", "memory"] {
        let wanted = limit(desired, resource);
        let found = limit(observed, resource);
        if !quantities_equal(wanted, found) {
            debug!(
                resource,
                desired = wanted.map(|q| q.0.as_str()),
                observed = found.map(|q| q.0.as_str()),
                "Resource limit not equal"
            );
            return false;
        }
    }

    true
}

fn primary_container(pod: &Pod) -> Option<&Container> {
    pod.spec.as_ref()?.containers.first()
}

fn limit<'a>(container: &'a Container, resource: &str) -> Option<&'a Quantity> {
    container.resources.as_ref()?.limits.as_ref()?.get(resource)
}

/// Numeric comparison honouring unit suffixes, so `1000m == 1` and `1Gi == 1024Mi`.
/// Unparseable quantities fall back to string equality.
pub fn quantities_equal(a: Option<&Quantity>, b: Option<&Quantity>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => match (parse_quantity(&a.0), parse_quantity(&b.0)) {
            (Some(a), Some(b)) => a == b,
            _ => a.0.trim() == b.0.trim(),
        },
        _ => false,
    }
}

const NANO_EXPONENT: i32 = 9;

/// Parse a Kubernetes quantity into integer nano-units.
///
/// Supports decimal SI suffixes (`n`, `u`, `m`, `k`, `M`, `G`, `T`, `P`, `E`),
/// binary suffixes (`Ki` .. `Ei`) and decimal exponents (`1e3`). Precision below
/// one nano-unit is truncated.
pub fn parse_quantity(raw: &str) -> Option<i128> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    let (negative, number) = match number.as_bytes().first() {
        Some(b'-') => (true, &number[1..]),
        Some(b'+') => (false, &number[1..]),
        _ => (false, number),
    };
    let (integer, fraction) = number.split_once('.').unwrap_or((number, ""));
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    if !integer.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let (binary_shift, decimal_exponent) = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        exponent if exponent.starts_with(['e', 'E']) => (0, exponent[1..].parse::<i32>().ok()?),
        _ => return None,
    };

    let digits: i128 = format!("{integer}{fraction}").parse().ok()?;
    let mut value = digits.checked_shl(binary_shift)?;
    if binary_shift > 0 && value >> binary_shift != digits {
        return None;
    }

    let scale = NANO_EXPONENT + decimal_exponent - i32::try_from(fraction.len()).ok()?;
    if scale >= 0 {
        value = value.checked_mul(10i128.checked_pow(scale.unsigned_abs())?)?;
    } else {
        value /= 10i128.checked_pow(scale.unsigned_abs())?;
    }

    Some(if negative { -value } else { value })
}
