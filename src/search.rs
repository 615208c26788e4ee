//! Paged directory search.
//!
//! The paging loop is independent of the wire: it pulls pages from a
//! [`PageSource`], hands every entry to the caller's visitor and re-issues the
//! fetch with the server's continuation cookie until none remains.
//! [`LdapPageSource`] is the production source, attaching the paged-results
//! control (and optionally sort and show-deleted) to each round trip.

use async_trait::async_trait;
use ldap3::{Ldap, Scope, SearchEntry};

use crate::controls::{page_cookie, paged_control, show_deleted_control, sort_control, SortKey};
use crate::error::Result;

/// One page of entries plus the server's continuation cookie, if any.
pub struct Page<T> {
    pub entries: Vec<T>,
    pub cookie: Option<Vec<u8>>,
}

#[async_trait]
pub trait PageSource {
    type Entry;

    /// Fetches the page identified by `cookie` (empty on the first call).
    async fn fetch(&mut self, cookie: &[u8]) -> Result<Page<Self::Entry>>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub entries: u64,
    pub round_trips: u32,
}

/// Drives a paged search to completion. N entries at page size P cost
/// ceil(N/P) round trips and exactly N visitor calls.
pub async fn drive_pages<S, V>(source: &mut S, mut visit: V) -> Result<PageStats>
where
    S: PageSource + Send,
    S::Entry: Send,
    V: FnMut(S::Entry) + Send,
{
    let mut stats = PageStats::default();
    let mut cookie: Vec<u8> = Vec::new();

    loop {
        let page = source.fetch(&cookie).await?;
        stats.round_trips += 1;

        for entry in page.entries {
            stats.entries += 1;
            visit(entry);
        }

        match page.cookie {
            Some(next) => cookie = next,
            None => break,
        }
    }

    Ok(stats)
}

/// A fully resolved search: columns already translated to attribute names,
/// base and filter already rewritten for deleted mode if requested.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: String,
    pub filter: String,
    pub scope: Scope,
    pub attrs: Vec<String>,
    pub page_size: i32,
    pub sort: Vec<SortKey>,
    pub deleted: bool,
}

/// Conjoins the tombstone marker with the caller's filter.
pub fn deleted_filter(filter: &str) -> String {
    if filter.starts_with('(') {
        format!("(&(isDeleted=TRUE){filter})")
    } else {
        format!("(&(isDeleted=TRUE)({filter}))")
    }
}

pub struct LdapPageSource<'a> {
    ldap: &'a mut Ldap,
    request: &'a SearchRequest,
}

impl<'a> LdapPageSource<'a> {
    pub fn new(ldap: &'a mut Ldap, request: &'a SearchRequest) -> Self {
        Self { ldap, request }
    }
}

#[async_trait]
impl PageSource for LdapPageSource<'_> {
    type Entry = SearchEntry;

    async fn fetch(&mut self, cookie: &[u8]) -> Result<Page<SearchEntry>> {
        let mut controls = vec![paged_control(self.request.page_size, cookie)];
        if !self.request.sort.is_empty() {
            controls.push(sort_control(&self.request.sort));
        }
        if self.request.deleted {
            controls.push(show_deleted_control());
        }

        let (entries, res) = self
            .ldap
            .with_controls(controls)
            .search(
                self.request.base.as_str(),
                self.request.scope,
                self.request.filter.as_str(),
                &self.request.attrs,
            )
            .await?
            .success()?;

        Ok(Page {
            entries: entries.into_iter().map(SearchEntry::construct).collect(),
            cookie: page_cookie(&res.ctrls),
        })
    }
}
