pub mod channel;
pub mod error;
pub mod tabs;

pub use channel::{BrowserControl, HttpControlChannel, TabInfo};
pub use error::ChannelError;
pub use tabs::{url_names_note, TabHandle, TabRegistry, SEARCH_TAB_INDEX};
