use std::collections::HashSet;

use anyhow::Result;
use regex::Regex;

use super::Value;
use crate::config::Settings;

/// Identifiers always redacted, in their normalized form.
const DEFAULT_REDACTED_IDENTIFIERS: &[&str] = &[
    "2fa",
    "accesstoken",
    "aiohttpsession",
    "apikey",
    "apisecret",
    "apisignature",
    "appkey",
    "applicationkey",
    "auth",
    "authorization",
    "authtoken",
    "ccnumber",
    "certificatepin",
    "cipher",
    "clientid",
    "clientsecret",
    "connectionstring",
    "connectsid",
    "cookie",
    "credentials",
    "creditcard",
    "csrf",
    "csrftoken",
    "cvv",
    "databaseurl",
    "dburl",
    "encryptionkey",
    "encryptionkeyid",
    "env",
    "geolocation",
    "gpgkey",
    "ipaddress",
    "jti",
    "jwt",
    "licensekey",
    "masterkey",
    "mysqlpwd",
    "nonce",
    "oauth",
    "oauthtoken",
    "otp",
    "passhash",
    "passwd",
    "password",
    "passwordb",
    "pemfile",
    "pgpkey",
    "phpsessid",
    "pin",
    "pincode",
    "pkcs8",
    "privatekey",
    "publickey",
    "pwd",
    "recaptchakey",
    "refreshtoken",
    "routingnumber",
    "salt",
    "secret",
    "secretkey",
    "secrettoken",
    "securityanswer",
    "securitycode",
    "securityquestion",
    "serviceaccountcredentials",
    "session",
    "sessionid",
    "sessionkey",
    "setcookie",
    "signature",
    "signaturekey",
    "sshkey",
    "ssn",
    "symfony",
    "token",
    "transactionid",
    "twiliotoken",
    "usersession",
    "voterid",
    "xapikey",
    "xauthtoken",
    "xcsrftoken",
    "xforwardedfor",
    "xrealip",
    "xsrf",
    "xsrftoken",
];

/// Decides which identifiers and value types are left out of captures.
#[derive(Debug)]
pub struct Redactor {
    identifiers: HashSet<String>,
    /// Matches redacted type names; `None` when none is configured.
    types: Option<Regex>,
}

impl Redactor {
    pub fn new(settings: &Settings) -> Result<Self> {
        let identifiers = DEFAULT_REDACTED_IDENTIFIERS
            .iter()
            .copied()
            .chain(settings.redacted_identifiers.iter().map(String::as_str))
            .map(normalize)
            .collect();

        let patterns: Vec<String> = settings
            .redacted_type_names
            .iter()
            .map(|name| match name.strip_suffix('*') {
                Some(prefix) => format!("{}.*", regex::escape(prefix)),
                None => regex::escape(name),
            })
            .collect();
        let types = match patterns.is_empty() {
            true => None,
            false => Some(Regex::new(&format!("^(?:{})$", patterns.join("|")))?),
        };

        Ok(Self { identifiers, types })
    }

    /// Should a value named `name` be redacted?
    pub fn redact_identifier(&self, name: &str) -> bool {
        self.identifiers.contains(&normalize(name))
    }

    /// Should a value be redacted based on its runtime type?
    pub fn redact_type(&self, value: &Value) -> bool {
        self.redact_type_name(value.type_name())
    }

    pub fn redact_type_name(&self, type_name: &str) -> bool {
        match &self.types {
            Some(re) => !type_name.is_empty() && re.is_match(type_name),
            None => false,
        }
    }
}

/// Trim, lowercase and drop the `_`, `$` and `@` separators. Dashes are kept:
/// `pass-word` is not `password`.
fn normalize(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '_' | '$' | '@'))
        .collect()
}
