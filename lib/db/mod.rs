pub mod models;
pub mod schema;

use diesel_async::{
    pooled_connection::{
        deadpool::{BuildError, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncMysqlConnection,
};

pub type DbPool = Pool<AsyncMysqlConnection>;

pub fn build_db_pool(db_url: &str, max_size: usize) -> Result<DbPool, BuildError> {
    let manager = AsyncDieselConnectionManager::<AsyncMysqlConnection>::new(db_url);
    Pool::builder(manager).max_size(max_size.max(1)).build()
}
