pub mod server;

use url::Url;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        base_url: Url,
        production: bool,
    },
}
