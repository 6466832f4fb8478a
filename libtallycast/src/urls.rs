//! Public web links for sources and posts

use crate::error::{Result, TallyError};
use crate::sources::mastodon::split_handle;
use crate::types::Network;

/// Profile page for `username` on `network`
pub fn profile_url(network: Network, username: &str) -> Result<String> {
    Ok(match network {
        Network::Reddit => format!("https://reddit.com/user/{}", username),
        Network::Threads => format!("https://www.threads.net/@{}", username),
        Network::Twitch => format!("https://twitch.tv/{}", username),
        Network::DeviantArt => format!("https://www.deviantart.com/{}", username),
        Network::E621 => format!("https://e621.net/posts?tags=user:{}", username),
        Network::FurAffinity => format!("https://www.furaffinity.net/user/{}/", username),
        Network::Weasyl => format!("https://www.weasyl.com/~{}", username),
        Network::Mastodon => {
            let (user, domain) = split_handle(username)?;
            format!("https://{}/@{}", domain, user)
        }
        Network::SearchConsole => "https://search.google.com/search-console/".to_string(),
    })
}

/// Link to a stored post
///
/// `author` is the post's author column; Twitch ids that are all digits are
/// videos, anything else is a clip slug.
pub fn post_url(network: Network, author: &str, network_id: &str) -> Result<String> {
    Ok(match network {
        Network::Reddit => format!("https://reddit.com/comments/{}", network_id),
        Network::Threads => format!("https://www.threads.net/@{}/post/{}", author, network_id),
        Network::Twitch => {
            let numeric = !network_id.is_empty() && network_id.bytes().all(|b| b.is_ascii_digit());
            if numeric {
                format!("https://www.twitch.tv/videos/{}", network_id)
            } else {
                format!("https://www.twitch.tv/{}/clip/{}", author, network_id)
            }
        }
        Network::DeviantArt => format!("https://www.deviantart.com/{}/art/{}", author, network_id),
        Network::E621 => format!("https://e621.net/posts/{}", network_id),
        Network::FurAffinity => format!("https://www.furaffinity.net/view/{}/", network_id),
        Network::Weasyl => format!("https://www.weasyl.com/~{}/submissions/{}", author, network_id),
        Network::Mastodon => {
            let (user, domain) = split_handle(author)?;
            format!("https://{}/@{}/{}", domain, user, network_id)
        }
        Network::SearchConsole => {
            return Err(TallyError::InvalidInput(
                "Search Console sources have no posts".to_string(),
            ))
        }
    })
}
