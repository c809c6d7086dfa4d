pub mod ashare;
pub mod baidu;
pub mod github;
pub mod gold;
pub mod hackernews;
