//! Hand-written recursive descent SQL parser.
//!
//! Grammar surface: `SELECT` (field list, `COUNT(*)`, `COUNT_CACHED(*)`,
//! `RANK()`, aggregate functions), `FROM`, `WHERE` condition trees with
//! brackets and `equal_position()`, `[INNER|LEFT] JOIN ... ON`, `MERGE`,
//! `ORDER BY` (incl. `FIELD()` forced order), `LIMIT`/`OFFSET`,
//! `UPDATE ... SET|DROP`, `DELETE FROM`, `TRUNCATE` and a leading
//! `EXPLAIN`.

use smallvec::smallvec;
use vellum_ast::{
    AggType, AggregateEntry, BetweenFieldsEntry, CalcTotalMode, CondType, EntryNode, EntryTree,
    JoinEntry, JoinType, JoinedQuery, OpType, Query, QueryEntry, QueryType, SortEntry, UpdateEntry,
    UpdateMode,
};
use vellum_error::{Result, VellumError};
use vellum_types::{Point, Variant, VariantArray};

use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Original query text; raw slices back expression capture in
    /// `UPDATE ... SET f = expr` and json object literals.
    src: String,
}

impl Parser {
    #[must_use]
    pub fn new(tokens: Vec<Token>, src: String) -> Self {
        Self {
            tokens,
            pos: 0,
            src,
        }
    }

    /// Parse one SQL statement into a query.
    pub fn parse(sql: &str) -> Result<Query> {
        let mut parser = Self::new(Lexer::tokenize(sql), sql.to_owned());
        let q = parser.parse_statement()?;
        let tok = parser.next();
        if tok.is_sym(";") {
            let tok = parser.next();
            if tok.kind != TokenKind::Eof {
                return Err(err_at("unexpected token after ';'", &tok));
            }
        } else if tok.kind != TokenKind::Eof {
            return Err(err_at("unexpected token in query", &tok));
        }
        q.validate()?;
        Ok(q)
    }

    // -- token helpers ------------------------------------------------------

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or_else(|| {
            self.tokens.last().expect("token stream ends with eof")
        })
    }

    fn next(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        let tok = self.next();
        if tok.is_sym(sym) {
            Ok(())
        } else {
            Err(err_at(&format!("expected '{sym}'"), &tok))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        let tok = self.next();
        if tok.is_kw(kw) {
            Ok(())
        } else {
            Err(err_at(&format!("expected '{}'", kw.to_uppercase()), &tok))
        }
    }

    fn expect_name(&mut self) -> Result<Token> {
        let tok = self.next();
        if tok.kind == TokenKind::Name {
            Ok(tok)
        } else {
            Err(err_at("expected name", &tok))
        }
    }

    fn expect_number(&mut self) -> Result<usize> {
        let tok = self.next();
        if tok.kind != TokenKind::Number {
            return Err(err_at("expected number", &tok));
        }
        tok.text
            .parse::<usize>()
            .map_err(|_| err_at("expected non-negative number", &tok))
    }

    // -- statements ---------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Query> {
        let mut explain = false;
        if self.peek().is_kw("explain") {
            self.next();
            explain = true;
        }
        let tok = self.peek().clone();
        let mut q = if tok.is_kw("select") {
            self.next();
            self.parse_select()?
        } else if tok.is_kw("delete") {
            self.next();
            self.parse_delete()?
        } else if tok.is_kw("update") {
            self.next();
            self.parse_update()?
        } else if tok.is_kw("truncate") {
            self.next();
            let mut q = Query::new(self.expect_name()?.text);
            q.query_type = QueryType::Truncate;
            q
        } else {
            return Err(err_at("syntax error at or near", &tok));
        };
        q.explain = explain;
        Ok(q)
    }

    fn parse_select(&mut self) -> Result<Query> {
        let mut q = Query::new("");
        self.parse_select_list(&mut q)?;

        self.expect_kw("from")?;
        q.namespace = self.expect_name()?.text;

        loop {
            let tok = self.peek().clone();
            if tok.is_kw("where") {
                self.next();
                self.parse_where(&mut q)?;
            } else if tok.is_kw("limit") {
                self.next();
                q.limit = Some(self.expect_number()?);
            } else if tok.is_kw("offset") {
                self.next();
                q.offset = self.expect_number()?;
            } else if tok.is_kw("order") {
                self.next();
                self.parse_order_by(&mut q)?;
            } else if tok.is_kw("join") || tok.is_kw("left") {
                if tok.is_kw("left") {
                    self.next();
                    self.expect_kw("join")?;
                } else {
                    self.next();
                }
                self.parse_join(JoinType::LeftJoin, OpType::And, &mut q)?;
            } else if tok.is_kw("inner") {
                self.next();
                self.expect_kw("join")?;
                self.parse_join(JoinType::InnerJoin, OpType::And, &mut q)?;
            } else if tok.is_kw("merge") {
                self.next();
                self.parse_merge(&mut q)?;
            } else {
                break;
            }
        }
        Ok(q)
    }

    fn parse_select_list(&mut self, q: &mut Query) -> Result<()> {
        loop {
            let name = self.next();
            if name.is_sym("*") {
                if !q.can_add_select_filter() {
                    return Err(VellumError::conflict(
                        "aggregations are not compatible with explicit select fields",
                    ));
                }
                q.select_filter.clear();
            } else if self.peek().is_sym("(") {
                self.next();
                self.parse_select_function(&name, q)?;
                self.expect_sym(")")?;
            } else {
                if name.kind != TokenKind::Name {
                    return Err(err_at("expected field name", &name));
                }
                if !q.can_add_select_filter() {
                    return Err(VellumError::conflict(
                        "aggregations are not compatible with explicit select fields",
                    ));
                }
                q.select_filter.push(name.text);
            }
            if self.peek().is_sym(",") {
                self.next();
            } else {
                break;
            }
        }
        Ok(())
    }

    fn parse_select_function(&mut self, name: &Token, q: &mut Query) -> Result<()> {
        if name.is_kw("count") {
            q.calc_total = CalcTotalMode::Accurate;
            if q.select_filter.is_empty() {
                q.limit = Some(0);
            }
            self.expect_sym("*")?;
        } else if name.is_kw("count_cached") {
            q.calc_total = CalcTotalMode::Cached;
            if q.select_filter.is_empty() {
                q.limit = Some(0);
            }
            self.expect_sym("*")?;
        } else if name.is_kw("rank") {
            q.with_rank = true;
        } else if let Some(agg) = AggType::parse(&name.text.to_ascii_lowercase()) {
            if !q.can_add_aggregation(agg) || (!q.select_filter.is_empty() && agg != AggType::Distinct)
            {
                return Err(VellumError::conflict(
                    "aggregations are not compatible with explicit select fields",
                ));
            }
            let mut entry = AggregateEntry::new(agg, vec![self.expect_name()?.text]);
            while self.peek().is_sym(",") {
                self.next();
                entry.fields.push(self.expect_name()?.text);
            }
            loop {
                let tok = self.peek().clone();
                if tok.is_kw("order") {
                    self.next();
                    let mut forced = VariantArray::new();
                    self.parse_order_entries(&mut entry.sort, &mut forced)?;
                    if !forced.is_empty() {
                        return Err(VellumError::parse_sql(
                            "forced sort order is not available in aggregation sort",
                        ));
                    }
                } else if tok.is_kw("limit") {
                    self.next();
                    entry.limit = Some(self.expect_number()?);
                } else if tok.is_kw("offset") {
                    self.next();
                    entry.offset = self.expect_number()?;
                } else {
                    break;
                }
            }
            q.aggregations.push(entry);
        } else {
            return Err(err_at("unknown function name", name));
        }
        Ok(())
    }

    fn parse_delete(&mut self) -> Result<Query> {
        self.expect_kw("from")?;
        let mut q = Query::new(self.expect_name()?.text);
        q.query_type = QueryType::Delete;
        loop {
            let tok = self.peek().clone();
            if tok.is_kw("where") {
                self.next();
                self.parse_where(&mut q)?;
            } else if tok.is_kw("limit") {
                self.next();
                q.limit = Some(self.expect_number()?);
            } else if tok.is_kw("offset") {
                self.next();
                q.offset = self.expect_number()?;
            } else if tok.is_kw("order") {
                self.next();
                self.parse_order_by(&mut q)?;
            } else {
                break;
            }
        }
        Ok(q)
    }

    fn parse_update(&mut self) -> Result<Query> {
        let mut q = Query::new(self.expect_name()?.text);
        q.query_type = QueryType::Update;

        let tok = self.next();
        if tok.is_kw("set") {
            loop {
                let entry = self.parse_update_field()?;
                q.updates.push(entry);
                if self.peek().is_sym(",") {
                    self.next();
                } else {
                    break;
                }
            }
        } else if tok.is_kw("drop") {
            loop {
                let field = self.expect_name()?;
                q.updates.push(UpdateEntry {
                    column: field.text,
                    values: VariantArray::new(),
                    mode: UpdateMode::Drop,
                    is_expression: false,
                    is_array: false,
                });
                if self.peek().is_sym(",") {
                    self.next();
                } else {
                    break;
                }
            }
        } else {
            return Err(err_at("expected 'SET' or 'DROP'", &tok));
        }

        if self.peek().is_kw("where") {
            self.next();
            self.parse_where(&mut q)?;
        }
        Ok(q)
    }

    fn parse_update_field(&mut self) -> Result<UpdateEntry> {
        let column = self.expect_name()?.text;
        self.expect_sym("=")?;

        let mut entry = UpdateEntry {
            column,
            values: VariantArray::new(),
            mode: UpdateMode::Set,
            is_expression: false,
            is_array: false,
        };

        if self.peek().is_sym("[") {
            self.next();
            entry.is_array = true;
            if self.peek().is_sym("]") {
                self.next();
                return Ok(entry);
            }
            loop {
                self.parse_update_value(&mut entry)?;
                let tok = self.next();
                if tok.is_sym("]") {
                    break;
                }
                if !tok.is_sym(",") {
                    return Err(err_at("expected ']' or ','", &tok));
                }
            }
        } else {
            self.parse_update_value(&mut entry)?;
        }
        Ok(entry)
    }

    fn parse_update_value(&mut self, entry: &mut UpdateEntry) -> Result<()> {
        let tok = self.next();
        if tok.kind == TokenKind::String {
            entry.values.push(Variant::from(tok.text));
            return Ok(());
        }
        if tok.is_kw("null") {
            entry.values.push(Variant::Null);
            return Ok(());
        }
        if tok.is_sym("{") {
            // json object literal: raw-slice the balanced braces
            let start = tok.pos;
            let mut depth = 1usize;
            let end;
            loop {
                let t = self.next();
                if t.kind == TokenKind::Eof {
                    return Err(err_at("unterminated json object in SET", &t));
                }
                if t.is_sym("{") {
                    depth += 1;
                } else if t.is_sym("}") {
                    depth -= 1;
                    if depth == 0 {
                        end = t.pos + 1;
                        break;
                    }
                }
            }
            let text = self.src[start..end].to_owned();
            serde_json::from_str::<serde_json::Value>(&text)
                .map_err(|e| VellumError::parse_sql(format!("bad json object in SET: {e}")))?;
            entry.values.push(Variant::from(text));
            entry.mode = UpdateMode::SetJson;
            return Ok(());
        }
        // expression or scalar: collect tokens until a clause boundary
        let start = tok.pos;
        let mut count = 1usize;
        let first = tok;
        loop {
            let t = self.peek().clone();
            if t.kind == TokenKind::Eof
                || t.is_kw("where")
                || t.is_sym(",")
                || t.is_sym("]")
                || t.is_sym(";")
            {
                break;
            }
            self.next();
            count += 1;
        }
        if count == 1 {
            match token_to_variant(&first) {
                Ok(v) => entry.values.push(v),
                Err(_) => {
                    entry.values.push(Variant::from(first.text));
                    entry.is_expression = true;
                }
            }
        } else {
            let end = self.peek().pos.min(self.src.len());
            let text = self.src[start..end].trim().to_owned();
            entry.values.push(Variant::from(text));
            entry.is_expression = true;
        }
        Ok(())
    }

    // -- order by -----------------------------------------------------------

    fn parse_order_by(&mut self, q: &mut Query) -> Result<()> {
        let mut forced = VariantArray::new();
        self.parse_order_entries(&mut q.sort, &mut forced)?;
        q.forced_order = forced;
        Ok(())
    }

    fn parse_order_entries(
        &mut self,
        sort: &mut Vec<SortEntry>,
        forced: &mut VariantArray,
    ) -> Result<()> {
        self.expect_kw("by")?;
        loop {
            let tok = self.next();
            if tok.kind != TokenKind::Name && tok.kind != TokenKind::String {
                return Err(err_at("expected name in ORDER BY", &tok));
            }
            let mut entry = SortEntry {
                expression: tok.text.clone(),
                desc: false,
            };
            if tok.is_kw("field") && self.peek().is_sym("(") {
                self.next();
                entry.expression = self.expect_name()?.text;
                loop {
                    let t = self.next();
                    if t.is_sym(")") {
                        break;
                    }
                    if !t.is_sym(",") {
                        return Err(err_at("expected ')' or ','", &t));
                    }
                    if !sort.is_empty() {
                        return Err(VellumError::parse_sql(
                            "forced sort order is allowed for the first sorting entry only",
                        ));
                    }
                    let val = self.next();
                    forced.push(self.composite_or_scalar(val)?);
                }
            }
            let t = self.peek().clone();
            if t.is_kw("asc") {
                self.next();
            } else if t.is_kw("desc") {
                self.next();
                entry.desc = true;
            }
            sort.push(entry);
            if self.peek().is_sym(",") {
                self.next();
            } else {
                break;
            }
        }
        Ok(())
    }

    fn composite_or_scalar(&mut self, tok: Token) -> Result<Variant> {
        if tok.is_sym("{") {
            let mut items = Vec::new();
            loop {
                let t = self.next();
                items.push(token_to_variant(&t)?);
                let t = self.next();
                if t.is_sym("}") {
                    return Ok(Variant::Tuple(items));
                }
                if !t.is_sym(",") {
                    return Err(err_at("expected ',' in composite value", &t));
                }
            }
        }
        token_to_variant(&tok)
    }

    // -- where --------------------------------------------------------------

    fn parse_where(&mut self, q: &mut Query) -> Result<()> {
        // joins parsed before WHERE may already sit in the entry tree
        let mut stack: Vec<(OpType, EntryTree)> =
            vec![(OpType::And, std::mem::take(&mut q.entries))];
        let mut next_op = OpType::And;

        if self.peek().is_kw("not") {
            self.next();
            next_op = OpType::Not;
        }

        loop {
            let tok = self.next();

            if tok.is_sym("(") {
                stack.push((next_op, EntryTree::default()));
                next_op = OpType::And;
                if self.peek().is_kw("not") {
                    self.next();
                    next_op = OpType::Not;
                }
                continue;
            }

            if tok.kind == TokenKind::Number || tok.kind == TokenKind::String {
                return Err(err_at("value is invalid at this location", &tok));
            }

            if tok.is_kw("join") {
                self.parse_join_into(JoinType::LeftJoin, OpType::And, q, &mut stack)?;
            } else if tok.is_kw("left") {
                self.expect_kw("join")?;
                self.parse_join_into(JoinType::LeftJoin, OpType::And, q, &mut stack)?;
            } else if tok.is_kw("inner") {
                self.expect_kw("join")?;
                let jtype = if next_op == OpType::Or {
                    JoinType::OrInnerJoin
                } else {
                    JoinType::InnerJoin
                };
                self.parse_join_into(jtype, next_op, q, &mut stack)?;
                next_op = OpType::And;
            } else if tok.is_kw("st_dwithin") {
                let entry = self.parse_dwithin()?;
                stack
                    .last_mut()
                    .expect("stack never empty")
                    .1
                    .push(next_op, EntryNode::Condition(entry));
                next_op = OpType::And;
            } else if tok.kind == TokenKind::Name {
                let entry = self.parse_condition(tok, &mut next_op)?;
                stack
                    .last_mut()
                    .expect("stack never empty")
                    .1
                    .push(next_op, entry);
                next_op = OpType::And;
            } else {
                return Err(err_at("expected condition", &tok));
            }

            while self.peek().is_kw("equal_position") {
                self.next();
                self.parse_equal_position(
                    &mut stack.last_mut().expect("stack never empty").1,
                )?;
            }

            while stack.len() > 1 && self.peek().is_sym(")") {
                self.next();
                let (op, tree) = stack.pop().expect("len checked");
                stack
                    .last_mut()
                    .expect("stack never empty")
                    .1
                    .push(op, EntryNode::Bracket(tree));
                while self.peek().is_kw("equal_position") {
                    self.next();
                    self.parse_equal_position(
                        &mut stack.last_mut().expect("stack never empty").1,
                    )?;
                }
            }

            let tok = self.peek().clone();
            if tok.is_kw("and") {
                self.next();
                next_op = OpType::And;
                if self.peek().is_kw("not") {
                    self.next();
                    next_op = OpType::Not;
                }
            } else if tok.is_kw("or") {
                self.next();
                next_op = OpType::Or;
            } else if !(tok.is_kw("join") || tok.is_kw("inner") || tok.is_kw("left")) {
                break;
            }
        }

        if stack.len() != 1 {
            return Err(VellumError::parse_sql("unbalanced bracket in WHERE"));
        }
        let (_, tree) = stack.pop().expect("root");
        if tree.is_empty() {
            return Err(VellumError::parse_sql("expected condition after 'WHERE'"));
        }
        q.entries = tree;
        Ok(())
    }

    fn parse_condition(&mut self, field_tok: Token, next_op: &mut OpType) -> Result<EntryNode> {
        let field = field_tok.text;

        let cond_tok = self.next();
        let mut cond = if cond_tok.is_sym("<>") {
            *next_op = match *next_op {
                OpType::And => OpType::Not,
                OpType::Not => OpType::And,
                OpType::Or => {
                    return Err(VellumError::parse_sql(
                        "<> condition with OR is not supported",
                    ))
                }
            };
            CondType::Eq
        } else {
            cond_from_token(&cond_tok)?
        };

        let tok = self.next();
        if tok.is_kw("null") || tok.is_kw("empty") {
            return Ok(EntryNode::Condition(QueryEntry {
                field,
                cond: CondType::Empty,
                values: VariantArray::new(),
            }));
        }
        if tok.is_kw("not") {
            let t = self.next();
            if !(t.is_kw("null") || t.is_kw("empty")) {
                return Err(err_at("expected NULL after NOT", &t));
            }
            return Ok(EntryNode::Condition(QueryEntry {
                field,
                cond: CondType::Any,
                values: VariantArray::new(),
            }));
        }
        if tok.is_sym("(") {
            let mut values = VariantArray::new();
            if self.peek().is_sym(")") {
                self.next();
            } else {
                loop {
                    let t = self.next();
                    values.push(self.composite_or_scalar(t)?);
                    let t = self.next();
                    if t.is_sym(")") {
                        break;
                    }
                    if !t.is_sym(",") {
                        return Err(err_at("expected ')' or ','", &t));
                    }
                }
            }
            if cond == CondType::Eq {
                cond = CondType::Set;
            }
            return Ok(EntryNode::Condition(QueryEntry { field, cond, values }));
        }
        if tok.is_sym("[") {
            // composite literal: [v1, v2] compares a composite index key
            let mut items = Vec::new();
            loop {
                let t = self.next();
                items.push(token_to_variant(&t)?);
                let t = self.next();
                if t.is_sym("]") {
                    break;
                }
                if !t.is_sym(",") {
                    return Err(err_at("expected ']' or ','", &t));
                }
            }
            return Ok(EntryNode::Condition(QueryEntry {
                field,
                cond,
                values: smallvec![Variant::Tuple(items)],
            }));
        }
        if tok.kind == TokenKind::Name && !tok.is_kw("true") && !tok.is_kw("false") {
            return Ok(EntryNode::BetweenFields(BetweenFieldsEntry {
                first_field: field,
                cond,
                second_field: tok.text,
            }));
        }
        let value = self.composite_or_scalar(tok)?;
        Ok(EntryNode::Condition(QueryEntry {
            field,
            cond,
            values: smallvec![value],
        }))
    }

    fn parse_equal_position(&mut self, tree: &mut EntryTree) -> Result<()> {
        self.expect_sym("(")?;
        let mut fields = Vec::new();
        loop {
            let tok = self.expect_name()?;
            fields.push(tok.text);
            let tok = self.next();
            if tok.is_sym(")") {
                break;
            }
            if !tok.is_sym(",") {
                return Err(err_at("expected ','", &tok));
            }
        }
        if fields.len() < 2 {
            return Err(VellumError::logic(
                "equal_position() is supposed to have at least 2 arguments",
            ));
        }
        for f in &fields {
            let mut found = false;
            tree.walk_conditions(&mut |qe| {
                if &qe.field == f {
                    found = true;
                }
            });
            if !found {
                return Err(VellumError::parse_sql(format!(
                    "only fields present in 'WHERE' condition are allowed in equal_position(), found '{f}'"
                )));
            }
        }
        tree.equal_positions.push(fields);
        Ok(())
    }

    fn parse_dwithin(&mut self) -> Result<QueryEntry> {
        self.expect_sym("(")?;
        let mut field: Option<String> = None;
        let mut point: Option<Point> = None;

        for slot in 0..2 {
            let tok = self.next();
            if tok.is_kw("st_geomfromtext") {
                if point.is_some() {
                    return Err(err_at("duplicate geometry in ST_DWithin", &tok));
                }
                point = Some(self.parse_geom_from_text()?);
            } else if tok.kind == TokenKind::Name {
                if field.is_some() {
                    return Err(err_at("duplicate field in ST_DWithin", &tok));
                }
                field = Some(tok.text);
            } else {
                return Err(err_at("expected field or geometry", &tok));
            }
            if slot == 0 {
                self.expect_sym(",")?;
            }
        }
        self.expect_sym(",")?;
        let radius_tok = self.next();
        let radius = match token_to_variant(&radius_tok)? {
            Variant::Int(v) => f64::from(v),
            Variant::Int64(v) => v as f64,
            Variant::Double(v) => v,
            _ => return Err(err_at("expected number radius", &radius_tok)),
        };
        self.expect_sym(")")?;

        let (Some(field), Some(point)) = (field, point) else {
            return Err(VellumError::parse_sql(
                "ST_DWithin requires a field and a geometry argument",
            ));
        };
        Ok(QueryEntry {
            field,
            cond: CondType::DWithin,
            values: smallvec![point.to_variant(), Variant::Double(radius)],
        })
    }

    fn parse_geom_from_text(&mut self) -> Result<Point> {
        self.expect_sym("(")?;
        let tok = self.next();
        if tok.kind != TokenKind::String {
            return Err(err_at("expected geometry text", &tok));
        }
        let text = tok.text.trim();
        let rest = text
            .strip_prefix("point")
            .or_else(|| text.strip_prefix("POINT"))
            .ok_or_else(|| err_at("expected point geometry", &tok))?
            .trim_start();
        let inner = rest
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| err_at("malformed point geometry", &tok))?;
        let mut coords = inner.split_whitespace().map(str::parse::<f64>);
        let x = coords
            .next()
            .and_then(std::result::Result::ok)
            .ok_or_else(|| err_at("malformed point geometry", &tok))?;
        let y = coords
            .next()
            .and_then(std::result::Result::ok)
            .ok_or_else(|| err_at("malformed point geometry", &tok))?;
        if coords.next().is_some() {
            return Err(err_at("malformed point geometry", &tok));
        }
        self.expect_sym(")")?;
        Ok(Point::new(x, y))
    }

    // -- joins & merge ------------------------------------------------------

    fn parse_join(&mut self, jtype: JoinType, op: OpType, q: &mut Query) -> Result<()> {
        let mut stack: Vec<(OpType, EntryTree)> = vec![(OpType::And, std::mem::take(&mut q.entries))];
        self.parse_join_into(jtype, op, q, &mut stack)?;
        q.entries = stack.pop().expect("root tree").1;
        Ok(())
    }

    fn parse_join_into(
        &mut self,
        jtype: JoinType,
        op: OpType,
        q: &mut Query,
        stack: &mut Vec<(OpType, EntryTree)>,
    ) -> Result<()> {
        let tok = self.next();
        let mut sub = if tok.is_sym("(") {
            self.expect_kw("select")?;
            let inner = self.parse_select()?;
            self.expect_sym(")")?;
            inner
        } else if tok.kind == TokenKind::Name {
            Query::new(tok.text)
        } else {
            return Err(err_at("expected namespace or sub-query", &tok));
        };
        if !sub.joins.is_empty() || !sub.merges.is_empty() {
            return Err(VellumError::parse_sql("nested joins are not supported"));
        }
        let on = self.parse_join_on(&q.namespace, &sub.namespace)?;
        sub.query_type = QueryType::Select;

        let idx = q.joins.len();
        if jtype != JoinType::LeftJoin {
            let tree_op = if jtype == JoinType::OrInnerJoin {
                OpType::Or
            } else {
                op
            };
            stack
                .last_mut()
                .expect("stack never empty")
                .1
                .push(tree_op, EntryNode::JoinRef(idx));
        }
        q.joins.push(JoinedQuery {
            query: sub,
            join_type: jtype,
            on,
        });
        Ok(())
    }

    fn parse_join_on(&mut self, left_ns: &str, right_ns: &str) -> Result<Vec<JoinEntry>> {
        self.expect_kw("on")?;
        let braces = self.peek().is_sym("(");
        if braces {
            self.next();
        }
        let mut entries = Vec::new();
        let mut next_op = OpType::And;
        loop {
            let tok = self.peek().clone();
            if tok.is_kw("or") {
                self.next();
                next_op = OpType::Or;
                continue;
            }
            if tok.is_kw("and") {
                self.next();
                next_op = OpType::And;
                continue;
            }
            if braces && tok.is_sym(")") {
                self.next();
                break;
            }

            let (ns1, f1) = self.parse_joined_field(left_ns)?;
            let cond_tok = self.next();
            let cond = cond_from_token(&cond_tok)?;
            let (ns2, f2) = self.parse_joined_field(right_ns)?;

            let entry = if ns1.eq_ignore_ascii_case(left_ns) && ns2.eq_ignore_ascii_case(right_ns) {
                JoinEntry {
                    left_field: f1,
                    cond,
                    right_field: f2,
                    op: next_op,
                }
            } else if ns2.eq_ignore_ascii_case(left_ns) && ns1.eq_ignore_ascii_case(right_ns) {
                JoinEntry {
                    left_field: f2,
                    cond: cond.invert(),
                    right_field: f1,
                    op: next_op,
                }
            } else {
                return Err(VellumError::parse_sql(format!(
                    "unexpected namespaces in ON statement: '{ns1}' and '{ns2}'"
                )));
            };
            next_op = OpType::And;
            entries.push(entry);
            if !braces {
                break;
            }
        }
        if entries.is_empty() {
            return Err(VellumError::parse_sql("empty ON condition"));
        }
        Ok(entries)
    }

    fn parse_joined_field(&mut self, default_ns: &str) -> Result<(String, String)> {
        let tok = self.expect_name()?;
        match tok.text.split_once('.') {
            Some((ns, field)) => Ok((ns.to_owned(), field.to_owned())),
            None => Ok((default_ns.to_owned(), tok.text)),
        }
    }

    fn parse_merge(&mut self, q: &mut Query) -> Result<()> {
        self.expect_sym("(")?;
        self.expect_kw("select")?;
        let sub = self.parse_select()?;
        self.expect_sym(")")?;
        q.merges.push(JoinedQuery {
            query: sub,
            join_type: JoinType::Merge,
            on: vec![],
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn err_at(msg: &str, tok: &Token) -> VellumError {
    if tok.kind == TokenKind::Eof {
        VellumError::parse_sql(format!("{msg}, but reached the end of the query"))
    } else {
        VellumError::parse_sql(format!(
            "{msg}, but found '{}' at position {}",
            tok.text, tok.pos
        ))
    }
}

fn cond_from_token(tok: &Token) -> Result<CondType> {
    if tok.kind == TokenKind::Symbol {
        return Ok(match tok.text.as_str() {
            "=" | "==" => CondType::Eq,
            ">" => CondType::Gt,
            ">=" => CondType::Ge,
            "<" => CondType::Lt,
            "<=" => CondType::Le,
            _ => return Err(err_at("expected condition operator", tok)),
        });
    }
    if tok.kind == TokenKind::Name {
        let lower = tok.text.to_ascii_lowercase();
        return Ok(match lower.as_str() {
            "is" => CondType::Eq,
            "in" => CondType::Set,
            "range" => CondType::Range,
            "like" => CondType::Like,
            "allset" => CondType::AllSet,
            _ => return Err(err_at("expected condition operator", tok)),
        });
    }
    Err(err_at("expected condition operator", tok))
}

/// Decode a scalar token into a variant, mirroring the value-type
/// detection of the original SQL surface: digits-only is int64, digits
/// with a dot is double, anything else is a string.
pub(crate) fn token_to_variant(tok: &Token) -> Result<Variant> {
    match tok.kind {
        TokenKind::String => Ok(Variant::from(tok.text.as_str())),
        TokenKind::Number => {
            let text = &tok.text;
            if text.contains('.') || text.contains('e') || text.contains('E') {
                text.parse::<f64>()
                    .map(Variant::Double)
                    .map_err(|_| err_at("bad number", tok))
            } else {
                text.parse::<i64>()
                    .map(Variant::Int64)
                    .map_err(|_| err_at("bad number", tok))
            }
        }
        TokenKind::Name if tok.is_kw("true") => Ok(Variant::Bool(true)),
        TokenKind::Name if tok.is_kw("false") => Ok(Variant::Bool(false)),
        _ => Err(err_at("expected parameter", tok)),
    }
}

