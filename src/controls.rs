//! Server-control plumbing for paged, sorted and soft-deleted searches.
//!
//! ldap3 ships a typed paged-results control; the server-side sort request
//! (RFC 2891) and the show-deleted control are built here as raw controls,
//! with the sort key list BER-encoded through lber, the same encoder the
//! bundled controls use.

use std::str::FromStr;

use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use lber::common::TagClass;
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::write;

use crate::error::ScanError;

pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
pub const SHOW_DELETED_OID: &str = "1.2.840.113556.1.4.417";

/// One key of a server-side sort request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn ascending<A: Into<String>>(attribute: A) -> Self {
        SortKey {
            attribute: attribute.into(),
            ordering_rule: None,
            reverse: false,
        }
    }
}

/// Parses `attr`, `attr:asc` or `attr:desc`, as accepted on the command line.
impl FromStr for SortKey {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (attribute, order) = match s.split_once(':') {
            Some((a, o)) => (a, o),
            None => (s, "asc"),
        };
        if attribute.is_empty() {
            return Err(ScanError::Config(format!("empty sort attribute in {s:?}")));
        }
        let reverse = match order {
            "asc" => false,
            "desc" => true,
            other => {
                return Err(ScanError::Config(format!(
                    "sort order must be asc or desc, got {other:?}"
                )))
            }
        };
        Ok(SortKey {
            attribute: attribute.to_owned(),
            ordering_rule: None,
            reverse,
        })
    }
}

pub fn paged_control(size: i32, cookie: &[u8]) -> RawControl {
    RawControl::from(PagedResults {
        size,
        cookie: cookie.to_vec(),
    })
}

/// Builds the sort request control. Sent non-critical, so a server without
/// sort support returns unsorted pages instead of failing the search.
pub fn sort_control(keys: &[SortKey]) -> RawControl {
    let key_list = Tag::Sequence(Sequence {
        inner: keys.iter().map(sort_key_tag).collect(),
        ..Default::default()
    });

    let mut val = bytes::BytesMut::new();
    write::encode_into(&mut val, key_list.into_structure()).expect("sort key list encodes");

    RawControl {
        ctype: SORT_REQUEST_OID.to_owned(),
        crit: false,
        val: Some(val.to_vec()),
    }
}

fn sort_key_tag(key: &SortKey) -> Tag {
    let mut inner = vec![Tag::OctetString(OctetString {
        inner: key.attribute.clone().into_bytes(),
        ..Default::default()
    })];
    if let Some(ref rule) = key.ordering_rule {
        inner.push(Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: rule.clone().into_bytes(),
        }));
    }
    if key.reverse {
        inner.push(Tag::Boolean(Boolean {
            id: 1,
            class: TagClass::Context,
            inner: true,
        }));
    }
    Tag::Sequence(Sequence {
        inner,
        ..Default::default()
    })
}

/// The show-deleted control has no value; criticality makes a server that
/// cannot reveal tombstones reject the search instead of silently returning
/// nothing.
pub fn show_deleted_control() -> RawControl {
    RawControl {
        ctype: SHOW_DELETED_OID.to_owned(),
        crit: true,
        val: None,
    }
}

/// Extracts the continuation cookie from the response controls. `None` means
/// the server sent no paged-results control or an empty cookie, i.e. the
/// result set is exhausted.
pub fn page_cookie(ctrls: &[Control]) -> Option<Vec<u8>> {
    ctrls.iter().find_map(|ctrl| match ctrl {
        Control(Some(ControlType::PagedResults), raw) => {
            let paged: PagedResults = raw.parse();
            if paged.cookie.is_empty() {
                None
            } else {
                Some(paged.cookie)
            }
        }
        _ => None,
    })
}

#[cfg(test)]
mod test {
    use lber::structures::Integer;

    use super::*;

    #[test]
    fn sort_key_parsing() {
        assert_eq!("sn".parse::<SortKey>().unwrap(), SortKey::ascending("sn"));
        assert_eq!(
            "sn:desc".parse::<SortKey>().unwrap(),
            SortKey {
                attribute: "sn".to_owned(),
                ordering_rule: None,
                reverse: true,
            }
        );
        assert!("sn:sideways".parse::<SortKey>().is_err());
        assert!(":desc".parse::<SortKey>().is_err());
    }

    #[test]
    fn sort_control_encoding() {
        let ctrl = sort_control(&[SortKey::ascending("cn")]);
        assert_eq!(ctrl.ctype, SORT_REQUEST_OID);
        assert!(!ctrl.crit);
        // SEQUENCE { SEQUENCE { OCTET STRING "cn" } }
        assert_eq!(
            ctrl.val.as_deref(),
            Some(&[0x30, 0x06, 0x30, 0x04, 0x04, 0x02, b'c', b'n'][..])
        );
    }

    #[test]
    fn sort_control_reverse_carries_context_tag() {
        let ctrl = sort_control(&[SortKey {
            attribute: "sn".to_owned(),
            ordering_rule: None,
            reverse: true,
        }]);
        let val = ctrl.val.unwrap();
        // reverseOrder is tagged [1] within the key sequence
        assert!(val.windows(2).any(|w| w[0] == 0x81 && w[1] == 0x01));
    }

    fn paged_response_control(size: i64, cookie: &[u8]) -> Control {
        let val = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: size,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: cookie.to_vec(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        });
        let mut buf = bytes::BytesMut::new();
        write::encode_into(&mut buf, val.into_structure()).unwrap();
        Control(
            Some(ControlType::PagedResults),
            RawControl {
                ctype: "1.2.840.113556.1.4.319".to_owned(),
                crit: false,
                val: Some(buf.to_vec()),
            },
        )
    }

    #[test]
    fn cookie_extraction() {
        let ctrls = vec![paged_response_control(0, b"opaque")];
        assert_eq!(page_cookie(&ctrls), Some(b"opaque".to_vec()));

        let done = vec![paged_response_control(0, b"")];
        assert_eq!(page_cookie(&done), None);

        assert_eq!(page_cookie(&[]), None);
    }
}
