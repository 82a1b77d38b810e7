use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

const BASE_URL: &str = "/api/users";

/// 存储里的用户记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub age: u32,
    pub hobbies: Vec<String>,
}

/// 处理结果：状态码加 JSON body
#[derive(Debug, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            body: value.to_string(),
        }
    }

    fn message(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "message": message }))
    }
}

/// 易失的进程内用户存储。每个 worker 各有一份，互不共享
pub struct UserStore {
    users: Mutex<Vec<User>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(Vec::new()),
        }
    }

    /// 处理一个请求：method + path + body 进，状态码 + JSON 出。
    /// 路由之外的错误（如 body 不是 JSON）统一折成 500
    pub fn handle(&self, method: &str, path: &str, body: &[u8]) -> ApiResponse {
        match self.route(method, path, body) {
            Ok(response) => response,
            Err(message) => ApiResponse::message(500, &message),
        }
    }

    fn route(&self, method: &str, path: &str, body: &[u8]) -> Result<ApiResponse, String> {
        let item_prefix = format!("{}/", BASE_URL);
        if path == BASE_URL && method == "GET" {
            Ok(self.get_all_users())
        } else if path.starts_with(&item_prefix) && method == "GET" {
            Ok(self.get_user_by_id(path))
        } else if path == BASE_URL && method == "POST" {
            self.create_user(body)
        } else if path.starts_with(&item_prefix) && method == "PUT" {
            self.update_user(path, body)
        } else if path.starts_with(&item_prefix) && method == "DELETE" {
            Ok(self.delete_user(path))
        } else {
            Ok(ApiResponse::message(404, "Endpoint not found"))
        }
    }

    fn get_all_users(&self) -> ApiResponse {
        let users = self.users.lock().unwrap();
        ApiResponse::json(200, json!(&*users))
    }

    fn get_user_by_id(&self, path: &str) -> ApiResponse {
        let user_id = match extract_user_id(path) {
            Some(id) => id,
            None => return invalid_user_id(),
        };

        let users = self.users.lock().unwrap();
        match users.iter().find(|u| u.id == user_id) {
            Some(user) => ApiResponse::json(200, json!(user)),
            None => ApiResponse::message(404, "User not found"),
        }
    }

    fn create_user(&self, body: &[u8]) -> Result<ApiResponse, String> {
        let data = parse_request_body(body)?;
        let (username, age, hobbies) = match validate_user_data(&data) {
            Ok(fields) => fields,
            Err(message) => return Ok(ApiResponse::message(400, &message)),
        };

        let new_user = User {
            id: Uuid::new_v4(),
            username,
            age,
            hobbies,
        };

        let mut users = self.users.lock().unwrap();
        users.push(new_user.clone());
        Ok(ApiResponse::json(201, json!(new_user)))
    }

    fn update_user(&self, path: &str, body: &[u8]) -> Result<ApiResponse, String> {
        let user_id = match extract_user_id(path) {
            Some(id) => id,
            None => return Ok(invalid_user_id()),
        };

        let data = parse_request_body(body)?;
        let (username, age, hobbies) = match validate_user_data(&data) {
            Ok(fields) => fields,
            Err(message) => return Ok(ApiResponse::message(400, &message)),
        };

        let mut users = self.users.lock().unwrap();
        match users.iter_mut().find(|u| u.id == user_id) {
            Some(user) => {
                user.username = username;
                user.age = age;
                user.hobbies = hobbies;
                Ok(ApiResponse::json(200, json!(user)))
            }
            None => Ok(ApiResponse::message(404, "User not found")),
        }
    }

    fn delete_user(&self, path: &str) -> ApiResponse {
        let user_id = match extract_user_id(path) {
            Some(id) => id,
            None => return invalid_user_id(),
        };

        let mut users = self.users.lock().unwrap();
        match users.iter().position(|u| u.id == user_id) {
            Some(index) => {
                users.remove(index);
                // 204 不带 body
                ApiResponse {
                    status: 204,
                    body: String::new(),
                }
            }
            None => ApiResponse::message(404, "User not found"),
        }
    }
}

fn invalid_user_id() -> ApiResponse {
    ApiResponse::message(400, "Invalid userId format (must be UUID)")
}

/// 从 /api/users/{id} 中取出第三段并解析为 UUID
fn extract_user_id(path: &str) -> Option<Uuid> {
    let id = path.split('/').nth(3)?;
    Uuid::parse_str(id).ok()
}

/// 空 body 当作空对象，解析失败的错误向上冒泡成 500
fn parse_request_body(body: &[u8]) -> Result<Value, String> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| e.to_string())
}

/// 校验用户字段：三个字段都必须出现，类型分别为 string / number / string array
fn validate_user_data(data: &Value) -> Result<(String, u32, Vec<String>), String> {
    let username = data.get("username").filter(|v| !v.is_null());
    let age = data.get("age").filter(|v| !v.is_null());
    let hobbies = data.get("hobbies").filter(|v| !v.is_null());

    let (Some(username), Some(age), Some(hobbies)) = (username, age, hobbies) else {
        return Err("Missing required fields: username, age, and hobbies are required".to_string());
    };

    let type_error =
        "Invalid field types: username must be string, age must be number, hobbies must be array";

    let username = username.as_str().ok_or(type_error)?.to_string();
    let age = age.as_u64().and_then(|v| u32::try_from(v).ok()).ok_or(type_error)?;
    let hobbies = hobbies
        .as_array()
        .ok_or(type_error)?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or(type_error.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((username, age, hobbies))
}
