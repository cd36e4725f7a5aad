use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::webhooks::model::Category;

/// An integrated platform. Each one has its own ingress route, credentials,
/// and job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "bigcommerce")]
    BigCommerce,
    #[serde(rename = "b2b-bigcommerce")]
    B2bBigCommerce,
    #[serde(rename = "acumatica")]
    Acumatica,
}

impl Platform {
    pub const ALL: [Platform; 3] = [
        Platform::BigCommerce,
        Platform::B2bBigCommerce,
        Platform::Acumatica,
    ];

    /// Route segment and job type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::BigCommerce => "bigcommerce",
            Platform::B2bBigCommerce => "b2b-bigcommerce",
            Platform::Acumatica => "acumatica",
        }
    }

    pub fn job_type(&self) -> &'static str {
        self.as_str()
    }

    pub fn category(&self) -> Category {
        match self {
            Platform::BigCommerce => Category::B2c,
            Platform::B2bBigCommerce => Category::B2b,
            Platform::Acumatica => Category::Erp,
        }
    }

    pub fn env_prefix(&self) -> &'static str {
        match self {
            Platform::BigCommerce => "BIGCOMMERCE",
            Platform::B2bBigCommerce => "B2B_BIGCOMMERCE",
            Platform::Acumatica => "ACUMATICA",
        }
    }

    /// Header carrying the shared secret in header-match mode.
    pub fn secret_header(&self) -> &'static str {
        match self {
            Platform::BigCommerce | Platform::B2bBigCommerce => "x-bc-secret-key",
            Platform::Acumatica => "x-acumatica-secret-key",
        }
    }

    /// Header carrying the body signature in HMAC mode.
    pub fn signature_header(&self) -> &'static str {
        match self {
            Platform::BigCommerce | Platform::B2bBigCommerce => "x-bc-signature",
            Platform::Acumatica => "x-acumatica-signature",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}
