//! Publish profiles.
//!
//! A publish profile is the credential bundle the hosting platform hands out
//! for deploying to one application. It is an XML document holding one or
//! more `<publishProfile .../>` elements whose attributes carry the deployment
//! endpoint and basic-auth credentials.

use crate::provider::{HostingError, HostingResult};
use regex::{Captures, Regex};
use std::collections::HashMap;

/// Quoted attribute values may contain a literal `>`
const ELEMENT_PATTERN: &str = r#"<publishProfile\b((?:[^>"']|"[^"]*"|'[^']*')*)>"#;
const COMMENT_PATTERN: &str = r"(?s)<!--.*?-->";
const ATTRIBUTE_PATTERN: &str = r#"([A-Za-z_][-A-Za-z0-9_.:]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#;
const ENTITY_PATTERN: &str = r"&(#x[0-9A-Fa-f]+|#[0-9]+|quot|apos|lt|gt|amp);";

/// Preferred publish methods, best first
const PREFERRED_METHODS: [&str; 2] = ["ZipDeploy", "MSDeploy"];

#[derive(Clone, PartialEq, Eq)]
pub struct PublishProfile {
    pub profile_name: String,
    pub publish_method: String,
    /// Deployment (SCM) endpoint, usually `<site>.scm.<domain>:443`
    pub publish_url: String,
    pub user_name: String,
    pub user_pwd: String,
    pub destination_app_url: Option<String>,
    pub site_name: Option<String>,
}

impl std::fmt::Debug for PublishProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishProfile")
            .field("profile_name", &self.profile_name)
            .field("publish_method", &self.publish_method)
            .field("publish_url", &self.publish_url)
            .field("user_name", &self.user_name)
            .field("user_pwd", &"***")
            .field("destination_app_url", &self.destination_app_url)
            .field("site_name", &self.site_name)
            .finish()
    }
}

fn invalid(message: impl Into<String>) -> HostingError {
    HostingError::InvalidPublishProfile {
        message: message.into(),
    }
}

fn compile(pattern: &str) -> HostingResult<Regex> {
    Regex::new(pattern).map_err(|e| HostingError::Unknown {
        message: format!("Failed to compile pattern: {}", e),
    })
}

fn unescape(value: &str, entities: &Regex) -> String {
    entities
        .replace_all(value, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "quot" => Some('"'),
                "apos" => Some('\''),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                _ => entity
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                    .and_then(|code| code.ok())
                    .and_then(char::from_u32),
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

impl PublishProfile {
    /// Parse the XML document and pick the profile used for zip deployment
    pub fn parse(xml: &str) -> HostingResult<Self> {
        if xml.trim().is_empty() {
            return Err(invalid("publish profile is empty"));
        }

        let comments = compile(COMMENT_PATTERN)?;
        let elements = compile(ELEMENT_PATTERN)?;
        let attributes = compile(ATTRIBUTE_PATTERN)?;
        let entities = compile(ENTITY_PATTERN)?;

        let xml = comments.replace_all(xml, "");
        let profiles: Vec<HashMap<String, String>> = elements
            .captures_iter(&xml)
            .map(|element| {
                attributes
                    .captures_iter(&element[1])
                    .map(|attr| {
                        let raw = attr
                            .get(2)
                            .or_else(|| attr.get(3))
                            .map_or("", |m| m.as_str());
                        (attr[1].to_string(), unescape(raw, &entities))
                    })
                    .collect()
            })
            .collect();

        if profiles.is_empty() {
            return Err(invalid("no publishProfile element found"));
        }

        let selected = PREFERRED_METHODS
            .iter()
            .find_map(|method| {
                profiles
                    .iter()
                    .find(|p| p.get("publishMethod").map(String::as_str) == Some(*method))
            })
            .ok_or_else(|| {
                invalid(format!(
                    "no profile with publish method {}",
                    PREFERRED_METHODS.join(" or ")
                ))
            })?;

        let required = |key: &str| -> HostingResult<String> {
            selected
                .get(key)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| invalid(format!("missing {} attribute", key)))
        };

        let optional = |key: &str| selected.get(key).filter(|v| !v.is_empty()).cloned();

        let profile = Self {
            profile_name: optional("profileName").unwrap_or_default(),
            publish_method: required("publishMethod")?,
            publish_url: required("publishUrl")?,
            user_name: required("userName")?,
            user_pwd: required("userPWD")?,
            destination_app_url: optional("destinationAppUrl"),
            site_name: optional("msdeploySite"),
        };

        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> HostingResult<()> {
        if self.publish_url.trim().is_empty() {
            return Err(invalid("publish URL cannot be empty"));
        }
        if self.user_name.trim().is_empty() || self.user_pwd.is_empty() {
            return Err(invalid("credentials cannot be empty"));
        }
        if self.publish_url.contains(char::is_whitespace) {
            return Err(invalid("publish URL contains whitespace"));
        }
        Ok(())
    }

    /// Base URL of the deployment endpoint, e.g. `https://app.scm.azurewebsites.net`
    pub fn scm_base_url(&self) -> String {
        let url = self.publish_url.trim().trim_end_matches('/');
        if url.starts_with("https://") || url.starts_with("http://") {
            return url.to_string();
        }
        let host = url.strip_suffix(":443").unwrap_or(url);
        format!("https://{}", host)
    }

    /// Application name, from `msdeploySite` or the `$name` deployment user
    pub fn app_name(&self) -> String {
        self.site_name
            .clone()
            .unwrap_or_else(|| self.user_name.trim_start_matches('$').to_string())
    }

    /// Public URL of the running application
    pub fn site_url(&self) -> Option<String> {
        self.destination_app_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_XML: &str = r#"<publishData>
  <publishProfile profileName="invoices - Web Deploy" publishMethod="MSDeploy"
    publishUrl="invoices.scm.azurewebsites.net:443" msdeploySite="invoices"
    userName="$invoices" userPWD="s3cr&amp;t&#33;" destinationAppUrl="https://invoices.azurewebsites.net">
    <databases />
  </publishProfile>
  <publishProfile profileName="invoices - FTP" publishMethod="FTP"
    publishUrl="ftps://waws-prod.ftp.azurewebsites.windows.net/site/wwwroot"
    userName="invoices\$invoices" userPWD="s3cr&amp;t&#33;" />
  <publishProfile profileName="invoices - Zip Deploy" publishMethod="ZipDeploy"
    publishUrl="invoices.scm.azurewebsites.net:443" userName="$invoices"
    userPWD="s3cr&amp;t&#33;" destinationAppUrl="https://invoices.azurewebsites.net/" />
</publishData>"#;

    #[test]
    fn test_parse_prefers_zip_deploy() {
        let profile = PublishProfile::parse(PROFILE_XML).unwrap();
        assert_eq!(profile.publish_method, "ZipDeploy");
        assert_eq!(profile.profile_name, "invoices - Zip Deploy");
        assert_eq!(profile.user_name, "$invoices");
        assert_eq!(profile.user_pwd, "s3cr&t!");
        assert_eq!(profile.scm_base_url(), "https://invoices.scm.azurewebsites.net");
        assert_eq!(
            profile.site_url().as_deref(),
            Some("https://invoices.azurewebsites.net")
        );
        assert_eq!(profile.app_name(), "invoices");
    }

    #[test]
    fn test_parse_falls_back_to_msdeploy() {
        let xml = r#"<publishData><publishProfile publishMethod='MSDeploy'
            publishUrl='app.scm.example.net:443' userName='$app' userPWD='pw'
            msdeploySite='app-site' /></publishData>"#;
        let profile = PublishProfile::parse(xml).unwrap();
        assert_eq!(profile.publish_method, "MSDeploy");
        assert_eq!(profile.app_name(), "app-site");
        assert_eq!(profile.site_url(), None);
    }

    #[test]
    fn test_parse_rejects_empty_input() {
        assert!(matches!(
            PublishProfile::parse("   \n"),
            Err(HostingError::InvalidPublishProfile { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_profile_documents() {
        assert!(PublishProfile::parse("not xml at all").is_err());
        assert!(PublishProfile::parse("<publishData></publishData>").is_err());
    }

    #[test]
    fn test_parse_rejects_unsupported_methods_only() {
        let xml = r#"<publishData><publishProfile publishMethod="FTP"
            publishUrl="ftps://host/site" userName="u" userPWD="p" /></publishData>"#;
        let err = PublishProfile::parse(xml).unwrap_err();
        assert!(err.to_string().contains("ZipDeploy"));
    }

    #[test]
    fn test_parse_rejects_missing_credentials() {
        let xml = r#"<publishData><publishProfile publishMethod="ZipDeploy"
            publishUrl="app.scm.example.net:443" userName="$app" userPWD="" /></publishData>"#;
        let err = PublishProfile::parse(xml).unwrap_err();
        assert!(err.to_string().contains("userPWD"));
    }

    #[test]
    fn test_parse_allows_angle_bracket_in_values() {
        let xml = r#"<publishData><publishProfile publishMethod="ZipDeploy"
            publishUrl="app.scm.example.net:443" userName="$app" userPWD="a>b'c"
            destinationAppUrl="https://app.example.net" /></publishData>"#;
        let profile = PublishProfile::parse(xml).unwrap();
        assert_eq!(profile.user_pwd, "a>b'c");
        assert_eq!(
            profile.destination_app_url.as_deref(),
            Some("https://app.example.net")
        );
    }

    #[test]
    fn test_parse_ignores_commented_out_profiles() {
        let xml = r#"<publishData>
  <!-- <publishProfile publishMethod="ZipDeploy" publishUrl="old.scm.example.net:443"
       userName="$old" userPWD="stale" /> -->
  <publishProfile publishMethod="MSDeploy" publishUrl="app.scm.example.net:443"
    userName="$app" userPWD="pw" />
</publishData>"#;
        let profile = PublishProfile::parse(xml).unwrap();
        assert_eq!(profile.publish_method, "MSDeploy");
        assert_eq!(profile.user_name, "$app");

        assert!(PublishProfile::parse(
            r#"<publishData><!-- <publishProfile publishMethod="ZipDeploy"
            publishUrl="x:443" userName="u" userPWD="p" /> --></publishData>"#
        )
        .is_err());
    }

    #[test]
    fn test_scm_base_url_keeps_explicit_scheme() {
        let mut profile = PublishProfile::parse(PROFILE_XML).unwrap();
        profile.publish_url = "http://127.0.0.1:8080/".to_string();
        assert_eq!(profile.scm_base_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_debug_hides_password() {
        let profile = PublishProfile::parse(PROFILE_XML).unwrap();
        let debug = format!("{:?}", profile);
        assert!(!debug.contains("s3cr"));
        assert!(debug.contains("***"));
    }
}
