mod concurrency;
mod container;
mod support;
