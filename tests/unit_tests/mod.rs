mod config;
mod operator;
