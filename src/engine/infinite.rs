// ============================================================================
// spark-query - Infinite Query Observer
// Page accumulation over a QueryObserver<InfiniteData>
// ============================================================================
//
// The cache entry for an infinite query stores the whole InfiniteData
// accumulation; page fetches are one-off transforms over the previously
// cached value. A refetch replays every known page param in order, so the
// page list and its params stay in lockstep.
// ============================================================================

use std::rc::Rc;

use crate::core::error::FetchError;
use crate::core::key::QueryKey;
use crate::core::options::ResolvedOptions;
use crate::core::snapshot::{InfiniteData, QuerySnapshot};
use crate::engine::client::QueryClient;
use crate::engine::fetch::FetchHandle;
use crate::engine::observer::{QueryObserver, Unsubscribe};

/// Fetches one page for a param.
pub type PageFetchFn<T, P> = Rc<dyn Fn(&QueryKey, &P) -> Result<T, FetchError>>;

/// Derives the next (or previous) page param from the accumulation so far;
/// `None` means there is no further page in that direction.
pub type PageParamFn<T, P> = Rc<dyn Fn(&InfiniteData<T, P>) -> Option<P>>;

// =============================================================================
// INFINITE QUERY OBSERVER
// =============================================================================

pub struct InfiniteQueryObserver<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    observer: QueryObserver<InfiniteData<T, P>>,
    page_fn: PageFetchFn<T, P>,
    next_param: Option<PageParamFn<T, P>>,
    previous_param: Option<PageParamFn<T, P>>,
    initial_param: P,
}

impl<T, P> Clone for InfiniteQueryObserver<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            observer: self.observer.clone(),
            page_fn: self.page_fn.clone(),
            next_param: self.next_param.clone(),
            previous_param: self.previous_param.clone(),
            initial_param: self.initial_param.clone(),
        }
    }
}

impl<T, P> InfiniteQueryObserver<T, P>
where
    T: Clone + 'static,
    P: Clone + PartialEq + 'static,
{
    pub fn new(
        client: QueryClient,
        options: ResolvedOptions,
        page_fn: PageFetchFn<T, P>,
        initial_param: P,
        next_param: Option<PageParamFn<T, P>>,
        previous_param: Option<PageParamFn<T, P>>,
    ) -> Self {
        // Base fetch: first page when nothing is cached, otherwise replay
        // every known param so a refetch rebuilds the full accumulation.
        let base_page_fn = page_fn.clone();
        let base_initial = initial_param.clone();
        let fetch_fn: Rc<
            dyn Fn(&QueryKey, Option<&InfiniteData<T, P>>) -> Result<InfiniteData<T, P>, FetchError>,
        > = Rc::new(move |key, prev| {
            let params: Vec<P> = match prev {
                Some(data) if !data.is_empty() => data.page_params.clone(),
                _ => vec![base_initial.clone()],
            };
            let mut out = InfiniteData::new();
            for param in params {
                out.pages.push(base_page_fn(key, &param)?);
                out.page_params.push(param);
            }
            Ok(out)
        });

        Self {
            observer: QueryObserver::new(client, options, fetch_fn),
            page_fn,
            next_param,
            previous_param,
            initial_param,
        }
    }

    pub fn optimistic_result(&self) -> QuerySnapshot<InfiniteData<T, P>> {
        self.observer.optimistic_result()
    }

    pub fn current_result(&self) -> QuerySnapshot<InfiniteData<T, P>> {
        self.observer.current_result()
    }

    pub fn subscribe(
        &self,
        push: impl Fn(QuerySnapshot<InfiniteData<T, P>>) + 'static,
    ) -> Unsubscribe {
        self.observer.subscribe(push)
    }

    pub fn set_options(&self, options: ResolvedOptions) {
        self.observer.set_options(options);
    }

    pub fn options(&self) -> ResolvedOptions {
        self.observer.options()
    }

    pub fn refetch(&self) -> FetchHandle {
        self.observer.refetch()
    }

    pub fn in_flight_handle(&self) -> Option<FetchHandle> {
        self.observer.in_flight_handle()
    }

    /// Fetch the page after the current last one. Settles Success without
    /// fetching when the param function reports no further page. With no
    /// pages cached yet, fetches the initial page instead.
    pub fn fetch_next_page(&self) -> FetchHandle {
        let page_fn = self.page_fn.clone();
        let next = self.next_param.clone();
        let initial = self.initial_param.clone();

        self.observer.fetch_with(Rc::new(move |key, prev| {
            let current = prev.cloned().unwrap_or_default();
            let param = if current.is_empty() {
                Some(initial.clone())
            } else {
                next.as_ref().and_then(|f| f(&current))
            };
            let Some(param) = param else {
                return Ok(current);
            };
            let page = page_fn(key, &param)?;
            let mut out = current;
            out.pages.push(page);
            out.page_params.push(param);
            Ok(out)
        }))
    }

    /// Fetch the page before the current first one; prepends to the
    /// accumulation. Same no-further-page semantics as `fetch_next_page`.
    pub fn fetch_previous_page(&self) -> FetchHandle {
        let page_fn = self.page_fn.clone();
        let previous = self.previous_param.clone();
        let initial = self.initial_param.clone();

        self.observer.fetch_with(Rc::new(move |key, prev| {
            let current = prev.cloned().unwrap_or_default();
            let param = if current.is_empty() {
                Some(initial.clone())
            } else {
                previous.as_ref().and_then(|f| f(&current))
            };
            let Some(param) = param else {
                return Ok(current);
            };
            let page = page_fn(key, &param)?;
            let mut out = current;
            out.pages.insert(0, page);
            out.page_params.insert(0, param);
            Ok(out)
        }))
    }

    pub fn is_destroyed(&self) -> bool {
        self.observer.is_destroyed()
    }

    pub fn destroy(&self) {
        self.observer.destroy();
    }

    pub(crate) fn client(&self) -> &QueryClient {
        self.observer.client()
    }
}

// =============================================================================
// TESTS
// =============================================================================
