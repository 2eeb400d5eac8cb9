use crate::config::RewriteConfig;
use crate::observer::looks_like_json;
use serde_json::{Map, Number, Value};

/// 被改写的请求路径
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// 请求体改写规则
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteRule {
    /// 目标模型（大小写不敏感）
    pub model: String,
    /// 目标 temperature
    pub temperature: Option<f64>,
}

/// 改写结果
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// 新的请求体
    Modified(String),
    /// 原样转发，附带原因
    Unchanged(&'static str),
}

impl RewriteRule {
    pub fn new(model: impl Into<String>, temperature: Option<f64>) -> Self {
        Self {
            model: model.into().trim().to_string(),
            temperature,
        }
    }

    /// 从配置构造；未启用时返回 None
    pub fn from_config(config: &RewriteConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.model.clone(), config.temperature))
    }

    /// 请求行是否为 `POST /v1/chat/completions`
    pub fn matches_request(method: &str, target: &str) -> bool {
        method.eq_ignore_ascii_case("POST") && target.eq_ignore_ascii_case(CHAT_COMPLETIONS_PATH)
    }

    /// 对 JSON 请求体应用规则
    ///
    /// 只有对象体且 `model` 与目标一致时才会改写；结果与原文相同视为未改写。
    /// JSON 解析失败作为错误返回，调用方应原样转发。
    pub fn apply(&self, body: &str) -> Result<Rewrite, serde_json::Error> {
        if self.model.is_empty() {
            return Ok(Rewrite::Unchanged("no target model"));
        }
        if !looks_like_json(body) {
            return Ok(Rewrite::Unchanged("body is not JSON"));
        }

        let mut root: Value = serde_json::from_str(body)?;
        let Some(obj) = root.as_object_mut() else {
            return Ok(Rewrite::Unchanged("body is not a JSON object"));
        };

        let model_matches = obj
            .get("model")
            .and_then(Value::as_str)
            .map(|m| m.trim().eq_ignore_ascii_case(&self.model))
            .unwrap_or(false);
        if !model_matches {
            return Ok(Rewrite::Unchanged("model does not match"));
        }

        let Some(target) = self.temperature else {
            return Ok(Rewrite::Unchanged("no target temperature"));
        };
        if current_temperature(obj) == Some(target) {
            return Ok(Rewrite::Unchanged("temperature already set"));
        }
        let Some(number) = Number::from_f64(target) else {
            return Ok(Rewrite::Unchanged("temperature is not finite"));
        };
        obj.insert("temperature".to_string(), Value::Number(number));

        let patched = serde_json::to_string(&root)?;
        if patched == body {
            Ok(Rewrite::Unchanged("serialization identical"))
        } else {
            Ok(Rewrite::Modified(patched))
        }
    }
}

fn current_temperature(obj: &Map<String, Value>) -> Option<f64> {
    obj.get("temperature").and_then(Value::as_f64)
}
