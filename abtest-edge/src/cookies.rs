//! Request cookie parsing and `Set-Cookie` construction.
use std::{fmt, time::Duration};

use hyper::{
    header::{InvalidHeaderValue, COOKIE},
    http::HeaderValue,
    HeaderMap,
};

/// Name of the cookie holding a visitor's group.
pub const ASSIGNMENT_COOKIE: &str = "cloudflare_ab_test";

/// Name of the cookie marking that a visitor's action has been counted.
pub const COUNTED_COOKIE: &str = "cloudflare_ab_test_counted";

/// Value of [`COUNTED_COOKIE`] once an action has been counted.
pub const COUNTED_VALUE: &str = "true";

/// The cookies sent with a request.
///
/// Cookies are read from every `Cookie` header present. When a name appears more than once, the
/// first occurrence wins.
#[derive(Debug, Default)]
pub struct RequestCookies<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> RequestCookies<'a> {
    /// Parses the cookies from the `Cookie` headers in `headers`.
    ///
    /// Headers are split into pairs before decoding, so a pair that is not valid UTF-8 is skipped
    /// without hiding its neighbours. Pairs without a `=` are ignored.
    pub fn from_headers(headers: &'a HeaderMap) -> Self {
        let pairs = headers
            .get_all(COOKIE)
            .iter()
            .flat_map(|value| value.as_bytes().split(|b| *b == b';'))
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .filter_map(parse_cookie_pair)
            .collect();
        Self { pairs }
    }

    /// Gets the value of the cookie called `name`.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.pairs.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }
}

fn parse_cookie_pair(pair: &str) -> Option<(&str, &str)> {
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    let value = value.trim().trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some((name, value))
    }
}

/// A cookie to set on the client, scoped to the whole site.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SetCookie<'a> {
    name: &'a str,
    value: &'a str,
    max_age: Duration,
}

impl<'a> SetCookie<'a> {
    /// Creates a new `SetCookie` that expires after `max_age`.
    pub fn new(name: &'a str, value: &'a str, max_age: Duration) -> Self {
        Self { name, value, max_age }
    }

    /// Renders this cookie as a `Set-Cookie` header value.
    ///
    /// # Errors
    ///
    /// If the name or value contain characters that are not allowed in a header, an error is
    /// returned.
    pub fn to_header_value(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.to_string())
    }
}

impl fmt::Display for SetCookie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}; Path=/; Max-Age={}", self.name, self.value, self.max_age.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::{header::COOKIE, http::HeaderValue, HeaderMap};
    use proptest::prelude::*;

    use super::{RequestCookies, SetCookie, ASSIGNMENT_COOKIE, COUNTED_COOKIE};

    fn headers(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(COOKIE, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn test_parse_single_header() {
        let header = "theme=dark; cloudflare_ab_test=variant ; cloudflare_ab_test_counted=true";
        let headers = headers(&[header]);
        let cookies = RequestCookies::from_headers(&headers);

        assert_eq!(cookies.get(ASSIGNMENT_COOKIE), Some("variant"));
        assert_eq!(cookies.get(COUNTED_COOKIE), Some("true"));
        assert_eq!(cookies.get("theme"), Some("dark"));
        assert_eq!(cookies.get("missing"), None);
    }

    #[test]
    fn test_prefix_does_not_match() {
        let headers = headers(&["cloudflare_ab_test_counted=true"]);
        let cookies = RequestCookies::from_headers(&headers);

        assert_eq!(cookies.get(COUNTED_COOKIE), Some("true"));
        assert_eq!(cookies.get(ASSIGNMENT_COOKIE), None);
    }

    #[test]
    fn test_multiple_headers_first_wins() {
        let headers = headers(&["cloudflare_ab_test=control", "cloudflare_ab_test=variant; a=b"]);
        let cookies = RequestCookies::from_headers(&headers);

        assert_eq!(cookies.get(ASSIGNMENT_COOKIE), Some("control"));
        assert_eq!(cookies.get("a"), Some("b"));
    }

    #[test]
    fn test_malformed_pairs_are_skipped() {
        let headers = headers(&["novalue; =orphan; quoted=\"control\";;"]);
        let cookies = RequestCookies::from_headers(&headers);

        assert_eq!(cookies.get("novalue"), None);
        assert_eq!(cookies.get(""), None);
        assert_eq!(cookies.get("quoted"), Some("control"));
    }

    #[test]
    fn test_no_cookie_header() {
        let headers = HeaderMap::new();
        assert_eq!(RequestCookies::from_headers(&headers).get(ASSIGNMENT_COOKIE), None);
    }

    #[test]
    fn test_non_utf8_pair_does_not_hide_others() {
        let mut headers = HeaderMap::new();
        let value = b"name=Jos\xc3\xa9; cloudflare_ab_test=control";
        headers.append(COOKIE, HeaderValue::from_bytes(value).unwrap());
        headers.append(COOKIE, HeaderValue::from_bytes(b"bad=\xff; theme=dark").unwrap());
        let cookies = RequestCookies::from_headers(&headers);

        assert_eq!(cookies.get(ASSIGNMENT_COOKIE), Some("control"));
        assert_eq!(cookies.get("name"), Some("Jos\u{e9}"));
        assert_eq!(cookies.get("bad"), None);
        assert_eq!(cookies.get("theme"), Some("dark"));
    }

    #[test]
    fn test_set_cookie() {
        let cookie = SetCookie::new(ASSIGNMENT_COOKIE, "control", Duration::from_secs(86_400));
        assert_eq!(cookie.to_string(), "cloudflare_ab_test=control; Path=/; Max-Age=86400");
        assert_eq!(
            cookie.to_header_value().unwrap(),
            "cloudflare_ab_test=control; Path=/; Max-Age=86400"
        );
    }

    #[test]
    fn test_set_cookie_rejects_invalid_value() {
        let cookie = SetCookie::new(ASSIGNMENT_COOKIE, "bad\nvalue", Duration::from_secs(1));
        assert!(cookie.to_header_value().is_err());
    }

    proptest! {
        #[test]
        fn parsed_pairs_are_found(
            name in "[a-z_]{1,12}",
            value in "[a-z0-9]{0,12}",
            other in "[a-z]{1,8}",
        ) {
            prop_assume!(name != other);
            let header = format!("{other}=x; {name}={value}");
            let headers = headers(&[header.as_str()]);
            let cookies = RequestCookies::from_headers(&headers);

            prop_assert_eq!(cookies.get(&name), Some(value.as_str()));
            prop_assert_eq!(cookies.get(&other), Some("x"));
        }
    }
}
