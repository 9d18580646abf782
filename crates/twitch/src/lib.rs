pub mod helix;
pub mod oauth;

pub use helix::{HelixClient, HelixError, HelixStream, HelixUser};
pub use oauth::{AppAccessToken, OAuthError, TwitchOAuthClient};
