//! Static per-provider settings.

use std::fmt;
use std::str::FromStr;

/// IMAP endpoint of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImapEndpoint {
    pub host: &'static str,
    pub port: u16,
}

/// Supported mail providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Gmail,
    MailRu,
    Yandex,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Gmail, Provider::MailRu, Provider::Yandex];

    /// Stable id stored in the database.
    pub fn id(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::MailRu => "mailru",
            Self::Yandex => "yandex",
        }
    }

    pub fn imap(self) -> ImapEndpoint {
        match self {
            Self::Gmail => ImapEndpoint { host: "imap.gmail.com", port: 993 },
            Self::MailRu => ImapEndpoint { host: "imap.mail.ru", port: 993 },
            Self::Yandex => ImapEndpoint { host: "imap.yandex.ru", port: 993 },
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            // "vk" is the id older installs stored for Mail.ru
            "mailru" | "mail.ru" | "vk" => Ok(Self::MailRu),
            "yandex" => Ok(Self::Yandex),
            other => Err(format!("unknown mail provider: {other}")),
        }
    }
}
