use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};
use crate::data::cache::Cache;
use crate::data::types::Article;

pub const INDEX_KEY: &str = "articles:index";

/// The articles currently being served, newest first, at most one per
/// market. Mirrored into the cache so it survives restarts; the in-memory
/// copy keeps serving when the cache is down.
pub struct ArticleBoard {
    articles: RwLock<Vec<Article>>,
    cache: Cache,
    max_articles: usize,
    ttl: Duration,
}

impl ArticleBoard {
    pub async fn load(cache: Cache, max_articles: usize, ttl: Duration) -> Self {
        let mut articles = cache
            .get_json::<Vec<Article>>(INDEX_KEY)
            .await
            .unwrap_or_default();
        normalize(&mut articles, max_articles);
        info!("Loaded {} articles from {} cache", articles.len(), cache.backend_name());

        Self {
            articles: RwLock::new(articles),
            cache,
            max_articles,
            ttl,
        }
    }

    pub fn current(&self) -> Vec<Article> {
        match self.articles.read() {
            Ok(articles) => articles.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    /// Put these articles on the board, each superseding whatever the board
    /// held for the same market, then persist.
    pub async fn publish(&self, incoming: Vec<Article>) {
        if incoming.is_empty() {
            return;
        }

        let snapshot = {
            let mut articles = match self.articles.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for article in incoming {
                articles.retain(|a| a.market_id != article.market_id);
                articles.push(article);
            }
            normalize(&mut articles, self.max_articles);
            articles.clone()
        };

        self.persist(&snapshot).await;
    }

    async fn persist(&self, snapshot: &[Article]) {
        if !self.cache.set_json(INDEX_KEY, &snapshot, self.ttl).await {
            warn!("Article index not persisted; serving from memory");
        }
    }
}

fn normalize(articles: &mut Vec<Article>, max_articles: usize) {
    articles.sort_by(|a, b| {
        b.generated_at
            .cmp(&a.generated_at)
            .then_with(|| a.market_id.cmp(&b.market_id))
    });
    articles.truncate(max_articles);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::cache::MemoryCache;
    use crate::data::types::{ArticleKind, ArticleStatus};
    use crate::testing::UnavailableCache;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn article(market_id: &str, minutes_ago: i64) -> Article {
        let generated_at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        Article {
            id: format!("{}-{}", market_id, minutes_ago),
            kind: ArticleKind::Analysis,
            market_id: market_id.to_string(),
            market_title: market_id.to_string(),
            title: "t".to_string(),
            teaser: String::new(),
            body: "b".to_string(),
            probability_pct: Some(50),
            close_time: Utc::now(),
            volume: 1,
            generated_at,
            word_count: 1,
            within_length_band: false,
            status: ArticleStatus::Active,
            outcome: None,
            original_article_id: None,
            fingerprint: String::new(),
        }
    }

    fn market_ids(board: &ArticleBoard) -> Vec<String> {
        board.current().into_iter().map(|a| a.market_id).collect()
    }

    #[tokio::test]
    async fn test_newest_first_one_per_market() {
        let cache = Cache::new(Arc::new(MemoryCache::new()), "t");
        let board = ArticleBoard::load(cache, 10, Duration::from_secs(60)).await;

        board.publish(vec![article("A", 30), article("B", 20)]).await;
        board.publish(vec![article("A", 5)]).await;

        assert_eq!(market_ids(&board), vec!["A", "B"]);
        assert_eq!(board.current()[0].id, "A-5");
    }

    #[tokio::test]
    async fn test_truncated_to_max() {
        let cache = Cache::new(Arc::new(MemoryCache::new()), "t");
        let board = ArticleBoard::load(cache, 2, Duration::from_secs(60)).await;

        board.publish(vec![article("A", 3), article("B", 2), article("C", 1)]).await;

        assert_eq!(market_ids(&board), vec!["C", "B"]);
    }

    #[tokio::test]
    async fn test_survives_reload_through_cache() {
        let backend = Arc::new(MemoryCache::new());
        let board = ArticleBoard::load(Cache::new(backend.clone(), "t"), 10, Duration::from_secs(60)).await;
        board.publish(vec![article("A", 1)]).await;

        let reloaded = ArticleBoard::load(Cache::new(backend, "t"), 10, Duration::from_secs(60)).await;

        assert_eq!(market_ids(&reloaded), vec!["A"]);
    }

    #[tokio::test]
    async fn test_serves_from_memory_when_cache_down() {
        let board = ArticleBoard::load(
            Cache::new(Arc::new(UnavailableCache), "t"),
            10,
            Duration::from_secs(60),
        )
        .await;

        board.publish(vec![article("A", 1)]).await;

        assert_eq!(board.len(), 1);
    }
}
