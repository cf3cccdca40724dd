//! Initial repository content: README, `.gitignore` and LICENSE templates.

use std::str::FromStr;

use chrono::{Datelike, Utc};

use crate::error::RepoError;

/// Files to commit into a freshly initialised repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedOptions {
    /// Write a README; the value is the repository description (may be empty).
    pub readme: Option<String>,
    pub gitignore: Option<GitignoreTemplate>,
    pub license: Option<License>,
    /// Copyright holder for the license text.
    pub license_holder: Option<String>,
}

impl SeedOptions {
    pub fn is_empty(&self) -> bool {
        self.readme.is_none() && self.gitignore.is_none() && self.license.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitignoreTemplate {
    Rust,
    Node,
    Python,
    Go,
}

impl FromStr for GitignoreTemplate {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rust" => Ok(Self::Rust),
            "node" | "nodejs" | "javascript" => Ok(Self::Node),
            "python" => Ok(Self::Python),
            "go" | "golang" => Ok(Self::Go),
            other => Err(RepoError::InvalidInput(format!(
                "unknown gitignore template: {other}"
            ))),
        }
    }
}

impl GitignoreTemplate {
    pub fn render(self) -> &'static str {
        match self {
            Self::Rust => "/target\n**/*.rs.bk\n*.pdb\n",
            Self::Node => "node_modules/\nnpm-debug.log*\nyarn-error.log*\n.env\ndist/\ncoverage/\n",
            Self::Python => {
                "__pycache__/\n*.py[cod]\n*.egg-info/\n.venv/\nvenv/\nbuild/\ndist/\n.pytest_cache/\n"
            }
            Self::Go => "*.exe\n*.test\n*.out\n/vendor/\n/bin/\n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum License {
    Mit,
    Apache2,
    Isc,
}

impl FromStr for License {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mit" => Ok(Self::Mit),
            "apache-2.0" | "apache2" | "apache" => Ok(Self::Apache2),
            "isc" => Ok(Self::Isc),
            other => Err(RepoError::InvalidInput(format!("unknown license: {other}"))),
        }
    }
}

impl License {
    pub fn spdx_id(self) -> &'static str {
        match self {
            Self::Mit => "MIT",
            Self::Apache2 => "Apache-2.0",
            Self::Isc => "ISC",
        }
    }

    pub fn render(self, year: i32, holder: &str) -> String {
        match self {
            Self::Mit => format!(
                "MIT License\n\n\
                 Copyright (c) {year} {holder}\n\n\
                 Permission is hereby granted, free of charge, to any person obtaining a copy\n\
                 of this software and associated documentation files (the \"Software\"), to deal\n\
                 in the Software without restriction, including without limitation the rights\n\
                 to use, copy, modify, merge, publish, distribute, sublicense, and/or sell\n\
                 copies of the Software, and to permit persons to whom the Software is\n\
                 furnished to do so, subject to the following conditions:\n\n\
                 The above copyright notice and this permission notice shall be included in all\n\
                 copies or substantial portions of the Software.\n\n\
                 THE SOFTWARE IS PROVIDED \"AS IS\", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR\n\
                 IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,\n\
                 FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE\n\
                 AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER\n\
                 LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,\n\
                 OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE\n\
                 SOFTWARE.\n"
            ),
            Self::Apache2 => format!(
                "Copyright {year} {holder}\n\n\
                 Licensed under the Apache License, Version 2.0 (the \"License\");\n\
                 you may not use this file except in compliance with the License.\n\
                 You may obtain a copy of the License at\n\n\
                 \x20   http://www.apache.org/licenses/LICENSE-2.0\n\n\
                 Unless required by applicable law or agreed to in writing, software\n\
                 distributed under the License is distributed on an \"AS IS\" BASIS,\n\
                 WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.\n\
                 See the License for the specific language governing permissions and\n\
                 limitations under the License.\n"
            ),
            Self::Isc => format!(
                "ISC License\n\n\
                 Copyright (c) {year} {holder}\n\n\
                 Permission to use, copy, modify, and/or distribute this software for any\n\
                 purpose with or without fee is hereby granted, provided that the above\n\
                 copyright notice and this permission notice appear in all copies.\n\n\
                 THE SOFTWARE IS PROVIDED \"AS IS\" AND THE AUTHOR DISCLAIMS ALL WARRANTIES\n\
                 WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF\n\
                 MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL THE AUTHOR BE LIABLE FOR\n\
                 ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES\n\
                 WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN\n\
                 ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF\n\
                 OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.\n"
            ),
        }
    }
}

pub fn render_readme(name: &str, description: &str) -> String {
    let description = description.trim();
    if description.is_empty() {
        format!("# {name}\n")
    } else {
        format!("# {name}\n\n{description}\n")
    }
}

/// `(path, contents)` pairs for the requested seed, in commit order.
pub fn seed_files(name: &str, owner: &str, seed: &SeedOptions) -> Vec<(&'static str, String)> {
    let mut files = Vec::new();
    if let Some(description) = &seed.readme {
        files.push(("README.md", render_readme(name, description)));
    }
    if let Some(template) = seed.gitignore {
        files.push((".gitignore", template.render().to_string()));
    }
    if let Some(license) = seed.license {
        let holder = seed.license_holder.as_deref().unwrap_or(owner);
        files.push(("LICENSE", license.render(Utc::now().year(), holder)));
    }
    files
}
