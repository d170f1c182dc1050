use crate::error::{InstallerError, InstallerResult};

pub fn validate_package_name(name: &str) -> InstallerResult<()> {
    if name.is_empty() {
        return Err(InstallerError::InvalidPackageName(
            "Package name cannot be empty".into(),
        ));
    }
    if name.starts_with('-') || name.starts_with('.') {
        return Err(InstallerError::InvalidPackageName(format!(
            "Package name cannot start with '{}': {}",
            &name[..1],
            name
        )));
    }
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.' | '+' | '@') {
            return Err(InstallerError::InvalidPackageName(format!(
                "Package name contains invalid character '{}': {}",
                c, name
            )));
        }
    }
    if name.len() > 255 {
        return Err(InstallerError::InvalidPackageName(
            "Package name too long (max 255 characters)".into(),
        ));
    }
    Ok(())
}

pub fn validate_package_names<S: AsRef<str>>(names: &[S]) -> InstallerResult<()> {
    for name in names {
        validate_package_name(name.as_ref())?;
    }
    Ok(())
}

/// Splits a selection the way list widgets hand it over: newline separated when
/// any newline is present, whitespace separated otherwise.
pub fn split_names(names: &str) -> Vec<String> {
    if names.contains('\n') {
        names
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    } else {
        names.split_whitespace().map(String::from).collect()
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }
    format!("{:.1} {}", size, UNITS[unit_index])
}

pub fn format_signed_size(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", format_size(bytes.unsigned_abs()))
    } else {
        format_size(bytes as u64)
    }
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        format!("{}h {}m", hours, minutes)
    }
}

pub fn is_root_user() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn require_root() -> InstallerResult<()> {
    if !is_root_user() {
        return Err(InstallerError::PermissionDenied(
            "This operation requires root privileges".into(),
        ));
    }
    Ok(())
}
