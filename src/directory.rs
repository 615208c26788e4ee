//! The directory facade: one pool, one attribute mapping, and the cached
//! root naming context for deleted-entry searches.

use std::future::Future;

use clap::ValueEnum;
use ldap3::{Scope, SearchEntry};
use tokio::sync::OnceCell;

use crate::columns::{AttributeMap, Column, Projection};
use crate::config::{LdapConfig, PoolConfig, SearchConfig};
use crate::controls::SortKey;
use crate::error::{Result, ScanError};
use crate::pool::{LdapConnector, LdapPool, PooledConn};
use crate::search::{deleted_filter, drive_pages, LdapPageSource, PageStats, SearchRequest};

/// A search as the caller states it, before column projection and
/// deleted-mode rewriting.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub base: Option<String>,
    pub filter: String,
    pub projection: Projection,
    pub columns: Vec<Column>,
    pub sort: Vec<SortKey>,
    pub deleted: bool,
}

pub struct LdapDirectory {
    pool: LdapPool<LdapConnector>,
    mappings: AttributeMap,
    search: SearchConfig,
    root_context: OnceCell<String>,
}

impl LdapDirectory {
    pub fn new(
        ldap: &LdapConfig,
        pool: PoolConfig,
        search: SearchConfig,
        mappings: AttributeMap,
    ) -> Self {
        Self {
            pool: LdapPool::new(LdapConnector::new(ldap), pool),
            mappings,
            search,
            root_context: OnceCell::new(),
        }
    }

    /// Runs a paged search, feeding every entry to `visit`. The connection is
    /// checked out for the whole search and released afterwards.
    pub async fn search<V>(&self, params: &SearchParams, visit: V) -> Result<PageStats>
    where
        V: FnMut(SearchEntry) + Send,
    {
        let mut conn = self.pool.get().await?;
        let result = self.search_on(&mut conn, params, visit).await;
        self.pool.release(conn).await;
        result
    }

    async fn search_on<V>(
        &self,
        conn: &mut PooledConn<LdapConnector>,
        params: &SearchParams,
        visit: V,
    ) -> Result<PageStats>
    where
        V: FnMut(SearchEntry) + Send,
    {
        let root = if params.deleted {
            Some(self.root_context(conn).await?.to_owned())
        } else {
            None
        };
        let request = self.plan(params, root.as_deref())?;

        debug!(
            "searching {} for {} ({} attributes)",
            request.base,
            request.filter,
            request.attrs.len()
        );

        let mut source = LdapPageSource::new(conn.ldap(), &request);
        drive_pages(&mut source, visit).await
    }

    /// Resolves a caller search into the request actually sent: columns
    /// projected, sort keys mapped, and deleted mode rewritten onto the root
    /// context, wherever the caller pointed the search.
    fn plan(&self, params: &SearchParams, root_context: Option<&str>) -> Result<SearchRequest> {
        let attrs = self.mappings.attributes(params.projection, &params.columns);

        let (base, filter) = if params.deleted {
            let root = root_context.ok_or(ScanError::NoRootContext)?;
            (root.to_owned(), deleted_filter(&params.filter))
        } else {
            let base = params
                .base
                .clone()
                .or_else(|| self.search.base.clone())
                .ok_or_else(|| {
                    ScanError::Config("no search base given and none configured".to_owned())
                })?;
            (base, params.filter.clone())
        };

        Ok(SearchRequest {
            base,
            filter,
            scope: self.search.scope.into(),
            attrs,
            page_size: self.search.page_size,
            sort: self.map_sort(&params.sort, params.projection),
            deleted: params.deleted,
        })
    }

    /// The attribute names a column set projects to, e.g. for a csv header.
    pub fn attributes_for(&self, projection: Projection, columns: &[Column]) -> Vec<String> {
        self.mappings.attributes(projection, columns)
    }

    /// Sort keys may name columns, which go through the attribute table like
    /// a projection; anything else is passed to the server as a raw attribute
    /// name.
    fn map_sort(&self, sort: &[SortKey], projection: Projection) -> Vec<SortKey> {
        sort.iter()
            .map(|key| {
                let attribute = Column::from_str(&key.attribute, true)
                    .ok()
                    .and_then(|column| self.mappings.attribute(projection, column))
                    .map(str::to_owned)
                    .unwrap_or_else(|| key.attribute.clone());
                SortKey {
                    attribute,
                    ..key.clone()
                }
            })
            .collect()
    }

    /// The directory's root naming context, probed once from the root DSE.
    async fn root_context(&self, conn: &mut PooledConn<LdapConnector>) -> Result<&str> {
        self.cached_root_context(|| async move {
            let (rs, _res) = conn
                .ldap()
                .search(
                    "",
                    Scope::Base,
                    "(objectClass=*)",
                    vec!["defaultNamingContext"],
                )
                .await?
                .success()?;

            for entry in rs {
                let entry = SearchEntry::construct(entry);
                if let Some(value) = entry
                    .attrs
                    .get("defaultNamingContext")
                    .and_then(|v| v.first())
                {
                    if !value.is_empty() {
                        info!("resolved root naming context {value}");
                        return Ok(value.clone());
                    }
                }
            }

            Err(ScanError::NoRootContext)
        })
        .await
    }

    /// Caches the first successful probe for the lifetime of the directory.
    /// A failed probe is not cached; the next deleted search tries again.
    async fn cached_root_context<F, Fut>(&self, probe: F) -> Result<&str>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.root_context
            .get_or_try_init(probe)
            .await
            .map(String::as_str)
    }

    /// Verifies credentials by re-binding a pooled connection as `dn`. The
    /// pool restores the service identity when the connection is released.
    pub async fn authenticate(&self, dn: &str, password: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        conn.mark_rebound();

        let outcome = conn.ldap().simple_bind(dn, password).await;
        let verdict = match outcome {
            // 49 invalidCredentials, 50 insufficientAccessRights
            Ok(res) if res.rc == 0 => Ok(true),
            Ok(res) if res.rc == 49 || res.rc == 50 => Ok(false),
            Ok(res) => Err(ScanError::BindRejected {
                dn: dn.to_owned(),
                rc: res.rc,
            }),
            Err(e) => Err(e.into()),
        };

        self.pool.release(conn).await;
        verdict
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
