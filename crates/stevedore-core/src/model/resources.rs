use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Advisory CPU/memory/GPU limits, mapped onto the container runtime's
/// host configuration where supported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceLimits {
    /// Milli-CPU strings, e.g. `"500m"` or `"2"`.
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    /// Bytes or `Ki`/`Mi`/`Gi` suffixed strings, e.g. `"512Mi"`.
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub gpu_count: Option<u64>,
}

impl ResourceLimits {
    /// CPU limit in Docker nano-CPU units, if set.
    pub fn nano_cpus(&self) -> Result<Option<i64>> {
        match &self.cpu_limit {
            Some(s) => Ok(Some(parse_milli_cpus(s)? as i64 * 1_000_000)),
            None => Ok(None),
        }
    }

    /// Memory limit in bytes, if set.
    pub fn memory_bytes(&self) -> Result<Option<i64>> {
        match &self.memory_limit {
            Some(s) => Ok(Some(parse_memory_bytes(s)? as i64)),
            None => Ok(None),
        }
    }

    /// Validate every populated field parses.
    pub fn validate(&self) -> Result<()> {
        for cpu in [&self.cpu_request, &self.cpu_limit].into_iter().flatten() {
            parse_milli_cpus(cpu)?;
        }
        for mem in [&self.memory_request, &self.memory_limit]
            .into_iter()
            .flatten()
        {
            parse_memory_bytes(mem)?;
        }
        Ok(())
    }
}

/// Parse a CPU quantity into milli-CPUs: `"500m"` -> 500, `"2"` -> 2000,
/// `"0.5"` -> 500.
pub fn parse_milli_cpus(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation("empty cpu quantity".into()));
    }

    if let Some(milli) = value.strip_suffix('m') {
        return milli
            .parse::<u64>()
            .map_err(|_| Error::Validation(format!("invalid cpu quantity '{value}'")));
    }

    let cores: f64 = value
        .parse()
        .map_err(|_| Error::Validation(format!("invalid cpu quantity '{value}'")))?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(Error::Validation(format!("invalid cpu quantity '{value}'")));
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parse a memory quantity into bytes: plain integers are bytes; `Ki`,
/// `Mi`, `Gi` suffixes are binary multiples.
pub fn parse_memory_bytes(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation("empty memory quantity".into()));
    }

    let (digits, multiplier) = if let Some(v) = value.strip_suffix("Ki") {
        (v, 1024u64)
    } else if let Some(v) = value.strip_suffix("Mi") {
        (v, 1024 * 1024)
    } else if let Some(v) = value.strip_suffix("Gi") {
        (v, 1024 * 1024 * 1024)
    } else {
        (value, 1)
    };

    let count: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid memory quantity '{value}'")))?;

    count
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Validation(format!("memory quantity '{value}' overflows")))
}
