// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

/// Collects the `/* ... */` comments of a query, joined with ", "
///
/// An unterminated comment is ignored.
pub fn extract_comments(query: &str) -> String {
    let mut found: Vec<&str> = Vec::new();
    let mut rest = query;

    while let Some(start) = rest.find("/*") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("*/") else {
            break;
        };
        let body = after[..end].trim();
        if !body.is_empty() {
            found.push(body);
        }
        rest = &after[end + 2..];
    }

    found.join(", ")
}
