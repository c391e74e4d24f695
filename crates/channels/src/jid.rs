//! JID helpers (`user[:device]@server`).

pub const USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";

/// The user part of a JID, without device suffix.
pub fn user_of(jid: &str) -> &str {
    let user = jid.split_once('@').map_or(jid, |(user, _)| user);
    user.split_once(':').map_or(user, |(user, _)| user)
}

pub fn server_of(jid: &str) -> Option<&str> {
    jid.split_once('@').map(|(_, server)| server)
}

pub fn is_group(jid: &str) -> bool {
    server_of(jid) == Some(GROUP_SERVER)
}

/// Build a user JID from a phone number.
pub fn user_jid(phone: &str) -> String {
    format!("{phone}@{USER_SERVER}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_device_and_server() {
        assert_eq!(user_of("628123:7@s.whatsapp.net"), "628123");
        assert_eq!(user_of("628123@s.whatsapp.net"), "628123");
        assert_eq!(user_of("628123"), "628123");
    }

    #[test]
    fn detects_groups() {
        assert!(is_group("120363025246125486@g.us"));
        assert!(!is_group("628123@s.whatsapp.net"));
        assert!(!is_group("no-server"));
    }

    #[test]
    fn builds_user_jid() {
        assert_eq!(user_jid("628123"), "628123@s.whatsapp.net");
    }
}
