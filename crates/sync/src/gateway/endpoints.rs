//! Endpoint resolution and credential formatting.

use std::str::FromStr;

use cartsync_core::LineId;
use url::Url;

/// How the credential is written into the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    #[default]
    Bearer,
    /// `Authorization: <token>`
    Raw,
}

impl FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bearer" => Ok(Self::Bearer),
            "raw" | "none" => Ok(Self::Raw),
            other => Err(format!("unknown auth scheme '{other}'")),
        }
    }
}

impl AuthScheme {
    const PREFIX: &'static str = "Bearer ";

    /// Header value for a raw token.
    #[must_use]
    pub fn format(self, token: &str) -> String {
        let bare = Self::strip(token);
        match self {
            Self::Bearer => format!("{}{bare}", Self::PREFIX),
            Self::Raw => bare.to_string(),
        }
    }

    /// Remove a leading `Bearer ` prefix (case-insensitive), if any.
    #[must_use]
    pub fn strip(value: &str) -> &str {
        let value = value.trim();
        match value.get(..Self::PREFIX.len()) {
            Some(head) if head.eq_ignore_ascii_case(Self::PREFIX) => {
                value.get(Self::PREFIX.len()..).unwrap_or_default().trim_start()
            }
            _ => value,
        }
    }
}

/// Absolute URLs of the cart service operations.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    /// Resolve endpoints against `base`, which should end with `/`.
    #[must_use]
    pub const fn new(base: Url) -> Self {
        Self { base }
    }

    /// `GET` the cart.
    #[must_use]
    pub fn cart(&self) -> Url {
        self.resolve(&["cart"])
    }

    /// `POST` a new item.
    #[must_use]
    pub fn cart_items(&self) -> Url {
        self.resolve(&["cart", "items"])
    }

    /// `PUT` a quantity or `DELETE` a line.
    #[must_use]
    pub fn cart_item(&self, line_id: &LineId) -> Url {
        self.resolve(&["cart", "items", line_id.as_str()])
    }

    fn resolve(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            // Drop the empty segment left by the trailing slash
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_format_and_strip() {
        assert_eq!(AuthScheme::Bearer.format("a.b.c"), "Bearer a.b.c");
        assert_eq!(AuthScheme::Bearer.format("Bearer a.b.c"), "Bearer a.b.c");
        assert_eq!(AuthScheme::Raw.format("bearer a.b.c"), "a.b.c");
        assert_eq!(AuthScheme::strip("  a.b.c "), "a.b.c");
        assert_eq!(AuthScheme::strip("BEARER  a.b.c"), "a.b.c");
    }

    #[test]
    fn test_scheme_from_str() {
        assert_eq!("Bearer".parse::<AuthScheme>().unwrap(), AuthScheme::Bearer);
        assert_eq!("raw".parse::<AuthScheme>().unwrap(), AuthScheme::Raw);
        assert!("basic".parse::<AuthScheme>().is_err());
    }

    #[test]
    fn test_endpoint_resolution() {
        let endpoints = Endpoints::new(Url::parse("https://shop.example/api/v1/").unwrap());
        assert_eq!(endpoints.cart().as_str(), "https://shop.example/api/v1/cart");
        assert_eq!(
            endpoints.cart_items().as_str(),
            "https://shop.example/api/v1/cart/items"
        );
        assert_eq!(
            endpoints.cart_item(&LineId::from(12)).as_str(),
            "https://shop.example/api/v1/cart/items/12"
        );
    }

    #[test]
    fn test_line_ids_are_percent_encoded() {
        let endpoints = Endpoints::new(Url::parse("https://shop.example/").unwrap());
        assert_eq!(
            endpoints.cart_item(&LineId::from("gid://line/1")).as_str(),
            "https://shop.example/cart/items/gid:%2F%2Fline%2F1"
        );
    }
}
