fn subdomain_base_url(subdomain: &str) -> String {
    format!("https://{subdomain}.repairshopr.com/api/v1")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_var<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn clamp_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Delay until the next full sync is due, given when the last one finished.
fn first_full_sync_delay(last_full_sync_at: Option<i64>, period: Duration, now: i64) -> Duration {
    let Some(last) = last_full_sync_at else {
        return Duration::ZERO;
    };
    let period_secs = i64::try_from(period.as_secs()).unwrap_or(i64::MAX);
    let due_at = last.saturating_add(period_secs);
    u64::try_from(due_at.saturating_sub(now))
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO)
}
