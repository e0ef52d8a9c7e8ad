//! Vocabulary store with favorite-word highlighting for page contexts.

pub mod client;
pub mod config;
pub mod dom;
pub mod highlight;
#[cfg(feature = "logging")]
pub mod logging;
pub mod notify;
pub mod page;
pub mod popup;
pub mod record;
pub mod rpc;
pub mod store;

pub use client::{ClientError, StoreClient};
pub use config::GlossmarkConfig;
pub use dom::{Document, NodeId, Rect};
pub use highlight::{FavoriteSet, HighlightEngine, HighlightError, HighlightReport, WordMatcher};
pub use notify::{ChangeNotifier, FavoritesObserver, PageEvent, PageId};
pub use page::{DetailView, InitOutcome, PageContext, PageError, PageInput, PointerEvent};
pub use popup::{PopupController, PopupEffect, PopupState, Position};
pub use record::{DictsData, ImportRecord, WordPatch, WordRecord};
pub use rpc::{ActionRequest, Dispatcher, PageChannel, RpcRequest, RpcResponse, StoreService};
pub use store::{StoreEngine, StoreError, WordQuery};
