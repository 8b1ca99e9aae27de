//! Kubernetes resource quantity parsing (`250m`, `4`, `16Gi`, `1e9`, ...).

use anyhow::{anyhow, bail, Context, Result};

const BINARY: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL: [(char, f64); 7] = [('m', 1e-3), ('k', 1e3), ('M', 1e6), ('G', 1e9), ('T', 1e12), ('P', 1e15), ('E', 1e18)];

fn number(s: &str, q: &str) -> Result<f64> {
    let v: f64 = s.parse().with_context(|| format!("invalid quantity {q:?}"))?;
    if !v.is_finite() || v < 0.0 {
        bail!("invalid quantity {q:?}");
    }
    Ok(v)
}

/// CPU quantity in millicores. Sub-millicore values round to the nearest millicore.
pub fn parse_cpu_millis(q: &str) -> Result<u64> {
    let t = q.trim();
    let (num, scale) = if let Some(n) = t.strip_suffix('n') {
        (n, 1e-6)
    } else if let Some(n) = t.strip_suffix('u') {
        (n, 1e-3)
    } else if let Some(n) = t.strip_suffix('m') {
        (n, 1.0)
    } else {
        (t, 1e3)
    };
    if num.is_empty() {
        bail!("invalid cpu quantity {q:?}");
    }
    Ok((number(num, q)? * scale).round() as u64)
}

/// Memory quantity in bytes.
pub fn parse_memory_bytes(q: &str) -> Result<u64> {
    let t = q.trim();
    if t.is_empty() {
        bail!("empty memory quantity");
    }
    for (suffix, mult) in BINARY {
        if let Some(n) = t.strip_suffix(suffix) {
            if let Ok(whole) = n.parse::<u64>() {
                return whole.checked_mul(mult).ok_or_else(|| anyhow!("memory quantity {q:?} overflows"));
            }
            return Ok((number(n, q)? * mult as f64).round() as u64);
        }
    }
    if let Ok(whole) = t.parse::<u64>() {
        return Ok(whole);
    }
    // plain decimals and exponents ("1.5e9"); a bare trailing "E" is the exa suffix
    if let Ok(v) = number(t, q) {
        return Ok(v.round() as u64);
    }
    let last = t.chars().last().unwrap_or_default();
    let (_, mult) = DECIMAL.iter().find(|(c, _)| *c == last).ok_or_else(|| anyhow!("unknown memory suffix in {q:?}"))?;
    let n = &t[..t.len() - last.len_utf8()];
    Ok((number(n, q)? * mult).round() as u64)
}
