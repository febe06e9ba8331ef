use pi_proto::pi::v1::{PackageInfo, UserInfo};

/// `pm install-create` prints `Success: created install session [1234]`.
pub(crate) fn parse_session_id(output: &str) -> Option<i32> {
    let start = output.find('[')?;
    let end = output[start..].find(']')? + start;
    output[start + 1..end].trim().parse().ok()
}

pub(crate) fn is_success(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.trim_start().starts_with("Success"))
}

/// Lines of `pm list packages -U -i --show-versioncode`, e.g.
/// `package:com.example versionCode:12 installer=com.android.vending uid:10123`.
pub(crate) fn parse_packages(output: &str) -> Vec<PackageInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let package_name = parts.next()?.strip_prefix("package:")?.to_string();
            if package_name.is_empty() {
                return None;
            }
            let mut info = PackageInfo {
                package_name,
                ..PackageInfo::default()
            };
            for part in parts {
                if let Some(value) = part.strip_prefix("versionCode:") {
                    info.version_code = value.parse().unwrap_or_default();
                } else if let Some(value) = part.strip_prefix("uid:") {
                    // Shared-user packages list several uids; the first is the app uid.
                    info.uid = value
                        .split(',')
                        .next()
                        .and_then(|uid| uid.parse().ok())
                        .unwrap_or_default();
                } else if let Some(value) = part.strip_prefix("installer=") {
                    if value != "null" {
                        info.installer = value.to_string();
                    }
                }
            }
            Some(info)
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct UserMarkers {
    pub(crate) partial: bool,
    pub(crate) dying: bool,
    pub(crate) pre_created: bool,
}

/// Lines of `pm list users`, e.g. `\tUserInfo{0:Owner:c13} running`.
pub(crate) fn parse_users(output: &str) -> Vec<(UserInfo, UserMarkers)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let body = line.strip_prefix("UserInfo{")?;
            let end = body.find('}')?;
            let (fields, rest) = (&body[..end], &body[end + 1..]);

            let mut split = fields.splitn(2, ':');
            let id = split.next()?.trim().parse().ok()?;
            let remainder = split.next().unwrap_or_default();
            let (name, flags) = match remainder.rsplit_once(':') {
                Some((name, flags)) => (name, i32::from_str_radix(flags.trim(), 16).unwrap_or(0)),
                None => (remainder, 0),
            };
            let rest = rest.to_ascii_lowercase();
            Some((
                UserInfo {
                    id,
                    name: name.to_string(),
                    flags,
                    running: rest.contains("running"),
                },
                UserMarkers {
                    partial: rest.contains("partial"),
                    dying: rest.contains("dying"),
                    pre_created: rest.contains("pre-created") || rest.contains("precreated"),
                },
            ))
        })
        .collect()
}

pub(crate) fn user_of_uid(uid: i32) -> i32 {
    uid / 100_000
}
